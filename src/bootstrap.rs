//! Per-node trust bootstrap.
//!
//! Drives one node through the handshake:
//!
//! ```text
//! Idle -> Generating -> Serving -> Stopped ----\
//!      \                                        -> Installed
//!       -> AwaitingSource -> Retrieving -> Retrieved
//!                                     \-> Failed
//! ```
//!
//! Any step can fail, which moves the node to `Failed` and aborts the
//! bootstrap. Nothing continues past a fatal error; the operator fixes the
//! cause and reruns.
//!
//! Cross-node ordering is not signalled in-band. Followers may start before
//! the Authority serves; their retry loop absorbs the race.

use crate::bundle::{BuiltinGenerator, BundleGenerator, CertutilGenerator, GenerationError, TrustBundle};
use crate::config::{ConfigError, GeneratorKind, NodeConfig};
use crate::distribution::{
    DistributionServer, RetrievalError, RetrievingClient, ServeError, SessionOptions, StopReason,
};
use crate::identity::{NodeIdentity, Role};
use crate::install::{BundleInstaller, InstallError, InstallOutcome, Owner};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

/// Node state across the whole handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Idle,
    Generating,
    AwaitingSource,
    Serving,
    Stopped,
    Retrieving,
    Retrieved,
    Installed,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Installed | NodeState::Failed)
    }

    fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Generating)
                | (Idle, AwaitingSource)
                | (Generating, Serving)
                | (Serving, Stopped)
                | (Stopped, Installed)
                | (AwaitingSource, Retrieving)
                | (Retrieving, Retrieved)
                | (Retrieved, Installed)
        )
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bundle generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("bundle distribution failed: {0}")]
    Serve(#[from] ServeError),

    #[error("bundle retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("bundle installation failed: {0}")]
    Install(#[from] InstallError),

    #[error("interrupted during {0}")]
    Interrupted(&'static str),

    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition { from: NodeState, to: NodeState },
}

/// Tracks and validates state transitions for one node.
#[derive(Debug, Clone)]
pub struct BootstrapMachine {
    state: NodeState,
    history: Vec<NodeState>,
}

impl Default for BootstrapMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapMachine {
    pub fn new() -> Self {
        Self {
            state: NodeState::Idle,
            history: vec![NodeState::Idle],
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn history(&self) -> &[NodeState] {
        &self.history
    }

    pub fn advance(&mut self, next: NodeState) -> Result<(), BootstrapError> {
        if !self.state.can_transition_to(next) {
            return Err(BootstrapError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        info!(from = ?self.state, to = ?next, "bootstrap state change");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = NodeState::Failed;
            self.history.push(NodeState::Failed);
        }
    }
}

/// Outcome of a successful bootstrap.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub identity: NodeIdentity,
    pub final_state: NodeState,
    pub transitions: Vec<NodeState>,
    pub fingerprint: String,
    pub bundle_bytes: usize,
    pub install_path: std::path::PathBuf,
    pub install_outcome: String,
    /// Authority: why the distribution session ended.
    pub stop_reason: Option<String>,
    pub fetches_served: Option<usize>,
    /// Follower: attempts the retrieval took.
    pub retrieval_attempts: Option<u32>,
}

/// Runs the bootstrap for one node.
pub struct Bootstrapper {
    config: NodeConfig,
    generator: Arc<dyn BundleGenerator>,
    client: RetrievingClient,
    installer: BundleInstaller,
    cancel: CancellationToken,
    machine: BootstrapMachine,
}

impl Bootstrapper {
    /// Wire real collaborators from configuration.
    pub fn from_config(config: NodeConfig) -> Result<Self, BootstrapError> {
        let generator: Arc<dyn BundleGenerator> = match &config.bundle.generator {
            GeneratorKind::Certutil { program } => Arc::new(CertutilGenerator::new(program)),
            GeneratorKind::Builtin => {
                Arc::new(BuiltinGenerator::new(config.identity.cluster_name.clone()))
            }
        };
        let client = RetrievingClient::http(
            config.retrieval.policy,
            config.retrieval.request_timeout,
        )?;
        let owner = Owner::lookup(&config.bundle.owner, &config.bundle.group)?;

        Ok(Self::new(config, generator, client, BundleInstaller::new(owner)))
    }

    pub fn new(
        config: NodeConfig,
        generator: Arc<dyn BundleGenerator>,
        client: RetrievingClient,
        installer: BundleInstaller,
    ) -> Self {
        Self {
            config,
            generator,
            client,
            installer,
            cancel: CancellationToken::new(),
            machine: BootstrapMachine::new(),
        }
    }

    /// Token that ends the Authority's distribution session early.
    ///
    /// Cancelled before the session starts, the bootstrap fails instead.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> NodeState {
        self.machine.state()
    }

    /// Run the handshake for this node's role.
    pub async fn run(&mut self) -> Result<BootstrapReport, BootstrapError> {
        let identity = self.config.identity.clone();
        let span = tracing::info_span!(
            "bootstrap",
            cluster = %identity.cluster_name,
            node = %identity.node_name,
            role = %identity.role
        );

        let result = async {
            match identity.role {
                Role::Authority => self.run_authority().await,
                Role::Follower => self.run_follower().await,
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(err) = &result {
            self.machine.fail();
            span.in_scope(|| error!(error = %err, "bootstrap failed"));
        }
        result
    }

    async fn run_authority(&mut self) -> Result<BootstrapReport, BootstrapError> {
        let bundle_settings = self.config.bundle.clone();

        self.machine.advance(NodeState::Generating)?;
        info!(
            generator = self.generator.name(),
            dir = %bundle_settings.work_dir.display(),
            "generating trust bundle"
        );
        let bundle = self
            .generator
            .generate(&bundle_settings.work_dir, &bundle_settings.file_name)
            .await?;
        info!(fingerprint = %bundle.fingerprint(), bytes = bundle.len(), "trust bundle generated");

        if self.cancel.is_cancelled() {
            return Err(BootstrapError::Interrupted("generation"));
        }

        let mut options = SessionOptions::new(self.config.distribution.bind)
            .with_cancellation(self.cancel.clone());
        options.timeout = self.config.distribution.session_timeout;
        options.stop_after_fetches = self.config.distribution.stop_after_fetches;

        let served_path = bundle_settings.work_dir.join(&bundle_settings.file_name);
        let mut session = DistributionServer::new(served_path, options).serve().await?;
        self.machine.advance(NodeState::Serving)?;

        let reason = session.wait().await?;
        let fetches = session.fetch_count();
        self.machine.advance(NodeState::Stopped)?;
        if reason == StopReason::TimedOut {
            info!(fetches, "distribution session timed out");
        }

        let outcome = self
            .installer
            .install(&bundle, &bundle_settings.install_path())?;
        self.machine.advance(NodeState::Installed)?;

        Ok(self.report(&bundle, outcome, Some((reason, fetches)), None))
    }

    async fn run_follower(&mut self) -> Result<BootstrapReport, BootstrapError> {
        let bundle_settings = self.config.bundle.clone();

        self.machine.advance(NodeState::AwaitingSource)?;
        let url = self.config.source_url().ok_or_else(|| {
            ConfigError::Invalid {
                problems: vec!["node.seed_hosts: a follower needs at least one seed host".to_string()],
            }
        })?;

        self.machine.advance(NodeState::Retrieving)?;
        let staging = bundle_settings
            .work_dir
            .join("incoming")
            .join(&bundle_settings.file_name);
        let retrieved = self.client.retrieve(&url, &staging).await?;
        self.machine.advance(NodeState::Retrieved)?;

        let outcome = self
            .installer
            .install(&retrieved.bundle, &bundle_settings.install_path())?;
        self.machine.advance(NodeState::Installed)?;

        // Staging copy is no longer needed; a leftover is harmless.
        if let Err(e) = std::fs::remove_file(&retrieved.path) {
            tracing::debug!(path = %retrieved.path.display(), error = %e, "could not remove staged bundle");
        }

        Ok(self.report(
            &retrieved.bundle,
            outcome,
            None,
            Some(retrieved.campaign.attempt_count()),
        ))
    }

    fn report(
        &self,
        bundle: &TrustBundle,
        outcome: InstallOutcome,
        session: Option<(StopReason, usize)>,
        retrieval_attempts: Option<u32>,
    ) -> BootstrapReport {
        BootstrapReport {
            identity: self.config.identity.clone(),
            final_state: self.machine.state(),
            transitions: self.machine.history().to_vec(),
            fingerprint: bundle.fingerprint(),
            bundle_bytes: bundle.len(),
            install_path: self.config.bundle.install_path(),
            install_outcome: format!("{:?}", outcome),
            stop_reason: session.map(|(reason, _)| format!("{:?}", reason)),
            fetches_served: session.map(|(_, fetches)| fetches),
            retrieval_attempts,
        }
    }
}
