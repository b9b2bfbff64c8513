//! cert-injector — rebuild a container image's trust layer so it carries
//! the operator-supplied certificates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cert_injector::command::ExecRunner;
use cert_injector::config::BundleConfigWriter;
use cert_injector::injector::{Injector, Tools};

#[derive(Parser, Debug)]
#[clap(
    name = "cert-injector",
    about = "Replaces a container image's trust layer with freshly imported certificates",
    version
)]
struct Cli {
    /// Driver store holding the base image layers
    driver_store: PathBuf,

    /// File containing the certificates to import
    cert_source: PathBuf,

    /// Image references to rebuild, processed in order
    #[clap(required = true, num_args = 1..)]
    image_refs: Vec<String>,

    /// Set log level (error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cert_data = std::fs::read(&cli.cert_source)
        .with_context(|| format!("failed to read cert source {}", cli.cert_source.display()))?;

    let injector = Injector::new(
        Arc::new(ExecRunner),
        Arc::new(BundleConfigWriter),
        Tools::default(),
    );
    injector
        .inject_all(&cli.driver_store, &cli.image_refs, &cert_data)
        .await?;

    Ok(())
}
