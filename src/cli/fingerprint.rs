use std::path::Path;
use trustseed::bundle::TrustBundle;

/// Print a bundle's fingerprint so operators can compare nodes.
pub fn execute(path: String) -> Result<(), Box<dyn std::error::Error>> {
    let bundle = TrustBundle::read(Path::new(&path))?;
    println!("{}  {}", bundle.fingerprint(), path);
    Ok(())
}
