//! Bundle generation (Authority only).
//!
//! Generation is one-shot: a failure here is fatal and is never retried.
//! The operator fixes the environment and reruns the bootstrap.
//!
//! Two backends implement [`BundleGenerator`]:
//! - [`CertutilGenerator`] drives the search engine's certificate tool
//!   (`ca`, then `cert --ca`) and produces a PKCS#12 keystore
//! - [`BuiltinGenerator`] builds the CA and a CA-signed transport
//!   certificate in-process and produces a PEM bundle

use super::{BundleError, TrustBundle};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::process::Command;
use zeroize::Zeroizing;

/// Default location of the certificate tool in distribution packages.
pub const DEFAULT_CERTUTIL_PATH: &str = "/usr/share/elasticsearch/bin/elasticsearch-certutil";

/// File name of the intermediate CA keystore. Stays in the scratch
/// directory and is never served.
const CA_FILE_NAME: &str = "elastic-stack-ca.p12";

/// Validity of builtin certificates (3 years, same as the tool's default).
const DEFAULT_VALIDITY_DAYS: i64 = 3 * 365;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to launch certificate tool '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate tool step '{step}' failed ({status}): {stderr}")]
    ToolFailed {
        step: &'static str,
        status: String,
        stderr: String,
    },

    #[error("certificate tool produced no usable bundle at '{0}'")]
    MissingOutput(PathBuf),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("scratch directory error under '{path}': {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Produces a CA and a CA-signed bundle in `output_dir`.
#[async_trait]
pub trait BundleGenerator: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Generate the bundle and write it to `output_dir/<file_name>`.
    ///
    /// The file must be complete by the time this returns; implementations
    /// write through [`TrustBundle::write_atomic`].
    async fn generate(
        &self,
        output_dir: &Path,
        file_name: &str,
    ) -> Result<TrustBundle, GenerationError>;
}

/// Drives the external certificate tool.
#[derive(Debug, Clone)]
pub struct CertutilGenerator {
    program: PathBuf,
}

impl Default for CertutilGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CERTUTIL_PATH)
    }
}

impl CertutilGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.kill_on_drop(true);
        command
    }

    async fn run_step(&self, step: &'static str, mut command: Command) -> Result<(), GenerationError> {
        tracing::debug!(program = %self.program.display(), step, "running certificate tool");

        let output: Output = command
            .output()
            .await
            .map_err(|source| GenerationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GenerationError::ToolFailed {
                step,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl BundleGenerator for CertutilGenerator {
    fn name(&self) -> &'static str {
        "certutil"
    }

    async fn generate(
        &self,
        output_dir: &Path,
        file_name: &str,
    ) -> Result<TrustBundle, GenerationError> {
        super::validate_file_name(file_name)?;

        let scratch_err = |source| GenerationError::Scratch {
            path: output_dir.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(output_dir).map_err(scratch_err)?;

        // Both steps run in a scratch directory removed on drop; only the
        // finished bundle reaches output_dir.
        let scratch = tempfile::Builder::new()
            .prefix(".certutil-")
            .tempdir_in(output_dir)
            .map_err(scratch_err)?;

        let ca_path = scratch.path().join(CA_FILE_NAME);
        let bundle_path = scratch.path().join(file_name);
        let mut ca = self.command();
        ca.arg("ca")
            .arg("--silent")
            .arg("--out")
            .arg(&ca_path)
            .arg("--pass")
            .arg("");
        self.run_step("ca", ca).await?;

        let mut cert = self.command();
        cert.arg("cert")
            .arg("--silent")
            .arg("--ca")
            .arg(&ca_path)
            .arg("--ca-pass")
            .arg("")
            .arg("--out")
            .arg(&bundle_path)
            .arg("--pass")
            .arg("");
        self.run_step("cert", cert).await?;

        let bundle = match TrustBundle::read(&bundle_path) {
            Ok(bundle) => bundle,
            Err(BundleError::Read { .. }) | Err(BundleError::Empty(_)) => {
                return Err(GenerationError::MissingOutput(bundle_path))
            }
            Err(e) => return Err(e.into()),
        };
        bundle.write_atomic(output_dir)?;

        Ok(bundle)
    }
}

/// Generates a CA and a shared transport certificate in-process.
///
/// The bundle is PEM: node certificate, CA certificate, node private key.
/// Every node receives the same key pair, exactly like the keystore the
/// external tool produces.
#[derive(Debug, Clone)]
pub struct BuiltinGenerator {
    cluster_name: String,
    validity_days: i64,
}

impl BuiltinGenerator {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }

    fn render(&self) -> Result<Zeroizing<String>, GenerationError> {
        let now = OffsetDateTime::now_utc();
        let not_after = now + time::Duration::days(self.validity_days);

        let ca_key = KeyPair::generate()?;
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        let mut ca_dn = DistinguishedName::new();
        ca_dn.push(DnType::CommonName, format!("{} transport CA", self.cluster_name));
        ca_params.distinguished_name = ca_dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = now;
        ca_params.not_after = not_after;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let node_key = KeyPair::generate()?;
        let mut node_params = CertificateParams::new(Vec::<String>::new())?;
        let mut node_dn = DistinguishedName::new();
        node_dn.push(DnType::CommonName, format!("{} transport", self.cluster_name));
        node_params.distinguished_name = node_dn;
        node_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        node_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        node_params.not_before = now;
        node_params.not_after = not_after;
        let node_cert = node_params.signed_by(&node_key, &ca_cert, &ca_key)?;

        let key_pem = Zeroizing::new(node_key.serialize_pem());
        let mut pem = Zeroizing::new(String::new());
        pem.push_str(&node_cert.pem());
        pem.push_str(&ca_cert.pem());
        pem.push_str(&key_pem);

        Ok(pem)
    }
}

#[async_trait]
impl BundleGenerator for BuiltinGenerator {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn generate(
        &self,
        output_dir: &Path,
        file_name: &str,
    ) -> Result<TrustBundle, GenerationError> {
        let pem = self.render()?;
        let bundle = TrustBundle::new(file_name, pem.as_bytes().to_vec())?;
        bundle.write_atomic(output_dir)?;
        Ok(bundle)
    }
}
