use anyhow::Context;
use colored::Colorize;
use stackforge_aws::{AwsCli, AwsCliProbe};
use stackforge_core::{ExistenceProbe, OfflineProbe, Orchestrator, RunReport, RunSettings};
use std::path::PathBuf;
use std::sync::Arc;

async fn probe(settings: &RunSettings, offline: bool) -> Arc<dyn ExistenceProbe> {
    if offline {
        tracing::info!("Offline mode: shared resources are always declared");
        return Arc::new(OfflineProbe);
    }

    let cli = AwsCli::new(settings.region.clone());
    match cli.check_installed().await {
        Ok(()) => Arc::new(AwsCliProbe::with_cli(cli)),
        Err(e) => {
            tracing::warn!("{}; existing shared resources will not be detected", e);
            Arc::new(OfflineProbe)
        }
    }
}

fn print_summary(report: &RunReport) {
    eprintln!();
    eprintln!("{} {}", "Stack:".bold(), report.stack_name.cyan());
    if let Some(network) = &report.network {
        eprintln!("  {} network {}", "✓".green(), network);
    }
    for id in &report.skipped {
        eprintln!("  {} {} (network foundation)", "-".dimmed(), id);
    }
    for outcome in &report.succeeded {
        eprintln!("  {} {} → {}", "✓".green(), outcome.id.cyan(), outcome.message);
    }
    for outcome in &report.failed {
        eprintln!(
            "  {} {} ({}): {}",
            "✗".red(),
            outcome.id.cyan(),
            outcome.kind.as_deref().unwrap_or("unknown"),
            outcome.message.red()
        );
    }
    eprintln!("  finished in {}ms", report.duration_ms);
}

pub async fn handle(
    config_path: Option<PathBuf>,
    output: Option<PathBuf>,
    offline: bool,
) -> anyhow::Result<()> {
    let (path, config) = super::load(config_path)?;
    tracing::info!("Synthesizing from {}", path.display());

    let settings = RunSettings::from_global(&config.global);
    let probe = probe(&settings, offline).await;
    let mut orchestrator = Orchestrator::new(stackforge_aws::builtin_registry(), settings, probe);

    let report = orchestrator
        .run(&config)
        .await
        .context("failed to build the network foundation")?;
    print_summary(&report);

    let template = orchestrator.session().stack.to_template();
    let rendered = serde_json::to_string_pretty(&template)?;
    match &output {
        Some(file) => {
            std::fs::write(file, rendered + "\n")
                .with_context(|| format!("failed to write {}", file.display()))?;
            eprintln!("{} {}", "Template written to".green(), file.display());
        }
        None => println!("{}", rendered),
    }

    if !report.is_success() {
        anyhow::bail!("{} of {} id(s) failed", report.failed.len(), config.enabled_forges.len());
    }
    Ok(())
}
