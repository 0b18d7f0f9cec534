use colored::Colorize;
use stackforge_core::{Config, ForgeError, ForgeRegistry};
use std::path::PathBuf;

/// Check one enabled id and return its forge type
pub fn check_id(registry: &ForgeRegistry, config: &Config, id: &str) -> Result<String, ForgeError> {
    let (kind, section, raw) = config
        .find_instance(id)
        .ok_or_else(|| ForgeError::InstanceNotFound(id.to_string()))?;
    let forge = registry.create_forge(kind)?;

    let blank = || {
        registry
            .create_instance(kind)
            .ok_or_else(|| ForgeError::UnknownForgeType(kind.to_string()))
    };
    let mut defaults = blank()?;
    defaults.load(&section.defaults)?;
    let mut instance = blank()?;
    instance.load(raw)?;
    forge.merge_configs(defaults.as_ref(), instance.as_ref())?;
    Ok(kind.to_string())
}

/// Every problem found in the configuration
pub fn findings(registry: &ForgeRegistry, config: &Config) -> Vec<String> {
    let mut findings = Vec::new();
    if config.global.stack_name.trim().is_empty() {
        findings.push("global.stackName is empty".to_string());
    }
    for duplicate in config.duplicate_ids() {
        findings.push(format!("duplicate instance id {}", duplicate));
    }
    for kind in config.forges.keys() {
        if !registry.has_forge(kind) {
            findings.push(format!("unknown forge type '{}'", kind));
        }
    }
    for id in &config.enabled_forges {
        if let Err(e) = check_id(registry, config, id) {
            findings.push(format!("{}: {}", id, e));
        }
    }
    findings
}

pub fn handle(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    println!("{}", "Validating configuration...".blue());
    let (path, config) = super::load(config_path)?;
    println!("Configuration: {}", path.display().to_string().cyan());

    let registry = stackforge_aws::builtin_registry();
    let problems = findings(&registry, &config);

    println!();
    println!("Enabled ids: {}", config.enabled_forges.len());
    for id in &config.enabled_forges {
        match config.find_instance(id) {
            Some((kind, _, _)) => println!("  - {} ({})", id.cyan(), kind),
            None => println!("  - {} ({})", id.cyan(), "not found".red()),
        }
    }

    if problems.is_empty() {
        println!("{}", "✓ Configuration is valid".green().bold());
        return Ok(());
    }

    println!();
    for problem in &problems {
        println!("  {} {}", "✗".red(), problem);
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_valid_configuration() {
        let registry = stackforge_aws::builtin_registry();
        let config = config(json!({
            "global": { "stackName": "demo" },
            "enabledForges": ["main", "web"],
            "forges": {
                "vpc": { "instances": [{ "id": "main" }] },
                "ec2": { "instances": [{ "id": "web", "instanceCount": 2 }] }
            }
        }));
        assert!(findings(&registry, &config).is_empty());
        assert_eq!(check_id(&registry, &config, "web").unwrap(), "ec2");
    }

    #[test]
    fn test_reports_every_problem() {
        let registry = stackforge_aws::builtin_registry();
        let config = config(json!({
            "enabledForges": ["web", "ghost", "odd"],
            "forges": {
                "ec2": { "instances": [{ "id": "web", "instanceCount": "many" }, { "id": "web" }] },
                "lambda": { "instances": [{ "id": "odd" }] }
            }
        }));

        let problems = findings(&registry, &config);
        assert_eq!(problems.len(), 6, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("stackName")));
        assert!(problems.iter().any(|p| p.contains("ec2:web")));
        assert!(problems.iter().any(|p| p.starts_with("ghost:")));
        assert!(problems.iter().any(|p| p.starts_with("odd:") && p.contains("lambda")));
    }
}
