use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use devserve::{
    IdentityDescriptor, ServeError, ServeMode, ServerConfig, ShutdownSignals, detect_backend,
    server,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Static file server for WASM builds.
///
/// Serves a directory over HTTP, or over HTTPS with a certificate generated
/// for this run only.
#[derive(Parser, Debug)]
#[command(name = "devserve")]
#[command(version, about)]
struct Args {
    /// Path to the server configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Port to listen on (default: 80 for plain, 443 for tls).
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Serve plain HTTP or HTTPS.
    #[arg(short = 'm', long, value_enum)]
    mode: Option<ServeMode>,

    /// Install the generated certificate into the host trust store.
    #[arg(long)]
    register: bool,

    /// Address to bind.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Directory to serve.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Do not send COOP/COEP headers.
    #[arg(long)]
    no_cross_origin_isolation: bool,
}

impl Args {
    /// Command-line flags take precedence over the config file.
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config from {:?}", path))?,
            None => ServerConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.port.is_some() {
            config.port = self.port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(root) = self.root {
            config.root = root;
        }
        if self.register {
            config.register = true;
        }
        if self.no_cross_origin_isolation {
            config.cross_origin_isolation = false;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", report(&e));
            ExitCode::FAILURE
        }
    }
}

/// The error chain, plus a hint when the host lacks a usable crypto backend.
fn report(e: &anyhow::Error) -> String {
    let mut message = format!("devserve: {:#}", e);
    if e
        .downcast_ref::<ServeError>()
        .is_some_and(ServeError::is_fatal_environment)
    {
        message.push_str(
            "\ndevserve: no usable cryptographic backend on this host; tls mode is unavailable, plain mode still works",
        );
    }
    message
}

fn run(args: Args) -> Result<()> {
    let config = args.into_config()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async {
        // Installed before anything touches the trust store, so an early
        // signal waits for cleanup instead of killing the process.
        let mut signals =
            ShutdownSignals::install().context("failed to install signal handlers")?;

        let trust_store = if config.register {
            Some(detect_backend().context("failed to select trust store")?)
        } else {
            None
        };

        let summary = server::run(
            &config,
            IdentityDescriptor::from_env(),
            trust_store,
            move |_| async move { signals.recv().await },
        )
        .await?;

        info!("shutdown complete ({})", summary.reason);
        anyhow::Ok(())
    })
}
