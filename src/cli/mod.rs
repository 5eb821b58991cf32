use clap::{Parser, Subcommand};
use std::path::PathBuf;
use trustseed::config::{default_config_path, NodeConfig};

pub mod bootstrap;
pub mod fetch;
pub mod fingerprint;
pub mod generate;
pub mod init_config;
pub mod install;
pub mod serve;
pub mod version;

#[derive(Parser)]
#[command(name = "trustseed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bootstrap shared transport trust across a search cluster", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a commented default configuration file
    InitConfig {
        /// Node role: authority (alias: master) or follower
        #[arg(long)]
        role: String,

        /// Path to config file (default: ~/.config/trustseed/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the full bootstrap for this node's role
    Bootstrap {
        /// Path to config file (default: ~/.config/trustseed/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a trust bundle without distributing it
    Generate {
        #[arg(long)]
        config: Option<String>,

        /// Directory to write the bundle to (default: bundle.work_dir)
        #[arg(long)]
        output_dir: Option<String>,
    },

    /// Serve an existing bundle for one distribution session
    Serve {
        #[arg(long)]
        config: Option<String>,

        /// Bundle to serve (default: <bundle.work_dir>/<bundle.file_name>)
        #[arg(long)]
        bundle: Option<String>,
    },

    /// Retrieve the bundle from the authority without installing it
    Fetch {
        #[arg(long)]
        config: Option<String>,

        /// Source URL (default: derived from the first seed host)
        #[arg(long)]
        url: Option<String>,

        /// Where to write the bundle (default: <bundle.work_dir>/incoming/<bundle.file_name>)
        #[arg(long)]
        output: Option<String>,
    },

    /// Install a bundle file into the node's config directory
    Install {
        #[arg(long)]
        config: Option<String>,

        /// Bundle file to install
        #[arg(long)]
        bundle: String,
    },

    /// Print the SHA-256 fingerprint of a bundle file
    Fingerprint {
        /// Bundle file
        path: String,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::InitConfig {
            role,
            config,
            force,
        } => init_config::execute(role, config, force),
        Commands::Bootstrap { config, json } => bootstrap::execute(config, json).await,
        Commands::Generate { config, output_dir } => generate::execute(config, output_dir).await,
        Commands::Serve { config, bundle } => serve::execute(config, bundle).await,
        Commands::Fetch {
            config,
            url,
            output,
        } => fetch::execute(config, url, output).await,
        Commands::Install { config, bundle } => install::execute(config, bundle),
        Commands::Fingerprint { path } => fingerprint::execute(path),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

fn config_path(config: Option<String>) -> PathBuf {
    config.map(PathBuf::from).unwrap_or_else(default_config_path)
}

/// Load the node configuration and install the log subscriber.
fn load_config(config: Option<String>) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let path = config_path(config);
    let config = NodeConfig::load(&path)?;
    trustseed::logging::init(&config.logging.level, config.logging.file.as_deref())?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}
