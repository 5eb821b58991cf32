use super::load_config;
use trustseed::bootstrap::Bootstrapper;
use trustseed::identity::Role;

/// Run the bootstrap for this node.
///
/// On the Authority, Ctrl-C ends the distribution session early; the bundle
/// is still installed locally. On a Follower, Ctrl-C aborts the retrieval
/// and nothing is installed.
pub async fn execute(config: Option<String>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let identity = config.identity.clone();

    if !json {
        println!("🔐 Bootstrapping transport trust for {}", identity);
        if let Some(url) = config.source_url().filter(|_| !identity.is_authority()) {
            println!("   Source: {}", url);
        }
    }

    let mut bootstrapper = Bootstrapper::from_config(config)?;
    let token = bootstrapper.cancellation_token();

    let run = bootstrapper.run();
    tokio::pin!(run);

    let report = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            if identity.role == Role::Follower {
                return Err("interrupted before the bundle was retrieved".into());
            }
            eprintln!("Stopping distribution session...");
            token.cancel();
            run.await?
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("✅ Trust bundle installed at {}", report.install_path.display());
    println!("   Fingerprint: {}", report.fingerprint);
    println!("   Size: {} bytes ({})", report.bundle_bytes, report.install_outcome);
    if let (Some(reason), Some(fetches)) = (&report.stop_reason, report.fetches_served) {
        println!("   Session ended: {} after {} fetch(es)", reason, fetches);
    }
    if let Some(attempts) = report.retrieval_attempts {
        println!("   Retrieved after {} attempt(s)", attempts);
    }
    println!();
    println!("Compare the fingerprint on every node before enabling transport TLS.");
    Ok(())
}
