use colored::Colorize;

pub fn handle() {
    let registry = stackforge_aws::builtin_registry();
    println!("{}", "Available forges:".bold());
    for kind in registry.forge_types() {
        let note = if kind == stackforge_core::NETWORK_FORGE {
            " (network foundation)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  - {}{}", kind.cyan(), note);
    }
}
