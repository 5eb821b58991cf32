use super::load_config;
use std::path::PathBuf;
use trustseed::distribution::RetrievingClient;

/// Retrieve the bundle with the configured retry policy, without installing.
pub async fn execute(
    config: Option<String>,
    url: Option<String>,
    output: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;

    let url = match url.or_else(|| config.source_url()) {
        Some(url) => url,
        None => return Err("no --url given and no seed_hosts configured".into()),
    };
    let output = output.map(PathBuf::from).unwrap_or_else(|| {
        config
            .bundle
            .work_dir
            .join("incoming")
            .join(&config.bundle.file_name)
    });

    let client = RetrievingClient::http(config.retrieval.policy, config.retrieval.request_timeout)?;
    println!(
        "📥 Fetching {} (up to {} attempts)",
        url,
        client.policy().max_attempts
    );

    let retrieved = client.retrieve(&url, &output).await?;

    println!(
        "✅ Wrote {} after {} attempt(s)",
        retrieved.path.display(),
        retrieved.campaign.attempt_count()
    );
    println!("   Fingerprint: {}", retrieved.bundle.fingerprint());
    println!("   Size: {} bytes", retrieved.bundle.len());
    Ok(())
}
