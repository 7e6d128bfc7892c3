//! The `probe` subcommand: run one extraction pipeline against a single
//! file and print what it found as JSON. Useful when tuning box geometry
//! or demand templates against a troublesome scan.

use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::{
    batch::{BatchContext, ExtractedFields},
    config::ExtractConfig,
    prelude::*,
};

/// Which extraction pipeline to run.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ProbeDocumentType {
    /// Extract a demand amount from the early pages.
    Complaint,
    /// Extract the mailing address from the last page.
    CoverSheet,
}

/// Options for the `probe` subcommand.
#[derive(Debug, Args)]
pub struct ProbeOpts {
    /// The scanned PDF to probe.
    pub path: PathBuf,

    /// Which extraction pipeline to run against it.
    #[clap(long = "document-type", value_enum)]
    pub document_type: ProbeDocumentType,

    /// A TOML or JSON configuration file overriding the built-in defaults.
    #[clap(long = "config")]
    pub config_path: Option<PathBuf>,
}

/// What `probe` prints.
#[derive(Debug, Serialize)]
struct ProbeReport {
    /// The probed file.
    path: String,

    /// The fields that extracted cleanly.
    fields: ExtractedFields,

    /// Messages for anything that did not.
    errors: Vec<String>,
}

/// Run the `probe` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_probe(opts: &ProbeOpts) -> Result<()> {
    let config = ExtractConfig::load(opts.config_path.as_deref()).await?;
    // The document directory is unused here; the file is given directly.
    let ctx = BatchContext::new(config, PathBuf::from("."));

    let (fields, errors) = match opts.document_type {
        ProbeDocumentType::Complaint => match ctx.demand_fields_from(&opts.path).await {
            Ok(fields) => (fields, vec![]),
            Err(err) => (ExtractedFields::default(), vec![err.to_string()]),
        },
        ProbeDocumentType::CoverSheet => match ctx.address_fields_from(&opts.path).await {
            Ok((fields, errors)) => (fields, errors),
            Err(err) => (ExtractedFields::default(), vec![err.to_string()]),
        },
    };

    let report = ProbeReport {
        path: opts.path.display().to_string(),
        fields,
        errors,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize probe report")?
    );
    Ok(())
}
