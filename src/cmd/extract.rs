//! The `extract` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    batch::{BatchContext, run_batch},
    cmd::StreamOpts,
    config::ExtractConfig,
    prelude::*,
    registry::Registry,
    ui::Ui,
};

/// Options for the `extract` subcommand.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The case registry CSV. Reads standard input when omitted.
    pub input_path: Option<PathBuf>,

    /// The directory holding the scanned documents.
    #[clap(long = "documents", default_value = ".")]
    pub document_dir: PathBuf,

    /// A TOML or JSON configuration file overriding the built-in defaults.
    #[clap(long = "config")]
    pub config_path: Option<PathBuf>,

    /// Write the output ledger here instead of standard output.
    #[clap(short = 'o', long = "output-path")]
    pub output_path: Option<PathBuf>,

    /// Stream processing options.
    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

/// Run the `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let config = ExtractConfig::load(opts.config_path.as_deref()).await?;
    let registry = Registry::read(opts.input_path.as_deref()).await?;
    let ctx = Arc::new(BatchContext::new(config, opts.document_dir.clone()));
    run_batch(
        &ui,
        registry,
        ctx,
        &opts.stream_opts,
        opts.output_path.as_deref(),
    )
    .await
}
