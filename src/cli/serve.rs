use super::load_config;
use std::path::PathBuf;
use trustseed::distribution::{DistributionServer, SessionOptions};

/// Serve an already generated bundle for one session.
///
/// Ends on the configured timeout, the fetch limit, or Ctrl-C.
pub async fn execute(
    config: Option<String>,
    bundle: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let bundle_path = bundle
        .map(PathBuf::from)
        .unwrap_or_else(|| config.bundle.work_dir.join(&config.bundle.file_name));

    let mut options = SessionOptions::new(config.distribution.bind);
    options.timeout = config.distribution.session_timeout;
    options.stop_after_fetches = config.distribution.stop_after_fetches;

    let mut session = DistributionServer::new(bundle_path, options).serve().await?;

    println!("📡 Serving {}", session.url());
    println!("   Fingerprint: {}", session.fingerprint());
    println!("   ⚠️  Plain HTTP without authentication; trusted networks only.");
    println!("   Press Ctrl-C to stop.");

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let reason = session.wait().await?;
    println!(
        "Session ended ({:?}) after {} fetch(es)",
        reason,
        session.fetch_count()
    );
    Ok(())
}
