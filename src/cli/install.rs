use super::load_config;
use std::path::Path;
use trustseed::install::{BundleInstaller, Owner};

/// Install a bundle file at the configured location with the configured
/// ownership.
pub fn execute(config: Option<String>, bundle: String) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let owner = Owner::lookup(&config.bundle.owner, &config.bundle.group)?;
    let dest = config.bundle.install_path();

    let (bundle, outcome) = BundleInstaller::new(owner).install_file(Path::new(&bundle), &dest)?;

    println!("✅ {} ({:?})", dest.display(), outcome);
    println!("   Fingerprint: {}", bundle.fingerprint());
    Ok(())
}
