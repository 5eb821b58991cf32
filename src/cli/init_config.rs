use super::config_path;
use trustseed::config::NodeConfig;
use trustseed::identity::Role;

/// Write a default configuration for the given role.
///
/// Refuses to clobber an existing file unless `force` is set.
pub fn execute(
    role: String,
    config: Option<String>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let role: Role = role.parse()?;
    let path = config_path(config);

    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    NodeConfig::create_default(&path, role)?;

    println!("✅ Wrote {} configuration to {}", role, path.display());
    println!("   Edit cluster_name, node_name and seed_hosts before bootstrapping.");
    Ok(())
}
