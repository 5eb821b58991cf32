use super::load_config;
use std::path::PathBuf;
use std::sync::Arc;
use trustseed::bundle::{BuiltinGenerator, BundleGenerator, CertutilGenerator};
use trustseed::config::GeneratorKind;

/// Generate a bundle with the configured generator, without serving it.
pub async fn execute(
    config: Option<String>,
    output_dir: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let output_dir = output_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| config.bundle.work_dir.clone());

    let generator: Arc<dyn BundleGenerator> = match &config.bundle.generator {
        GeneratorKind::Certutil { program } => Arc::new(CertutilGenerator::new(program)),
        GeneratorKind::Builtin => Arc::new(BuiltinGenerator::new(
            config.identity.cluster_name.clone(),
        )),
    };

    println!("🔧 Generating trust bundle with {}...", generator.name());
    let bundle = generator
        .generate(&output_dir, &config.bundle.file_name)
        .await?;

    println!(
        "✅ Wrote {}",
        output_dir.join(bundle.file_name()).display()
    );
    println!("   Fingerprint: {}", bundle.fingerprint());
    println!("   Size: {} bytes", bundle.len());
    Ok(())
}
