//! OCR adapter wrapping the `tesseract` CLI tool.

use std::time::Duration;

use image::DynamicImage;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    config::ExtractConfig,
    prelude::*,
};

/// Recognizes text in an image or image region.
///
/// Each call is a pure function of the input image and the configuration;
/// no state is retained between calls. A timeout or engine error is
/// reported as [`ExtractError::OcrFailure`], which callers treat as a
/// recoverable per-case or per-field failure.
#[derive(Clone, Debug)]
pub struct OcrAdapter {
    command: String,
    language: String,
    engine_mode: u32,
    dpi: u32,
    timeout: Duration,
}

impl OcrAdapter {
    /// Create an adapter from the run configuration.
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            command: config.ocr.command.clone(),
            language: config.ocr.language.clone(),
            engine_mode: config.ocr.engine_mode,
            dpi: config.render.dpi,
            timeout: Duration::from_secs(config.ocr.timeout_secs),
        }
    }

    /// Recognize text in an image.
    ///
    /// NOTE: the tesseract character whitelist only works for the legacy
    /// engine, not the LSTM engine, so we cannot force it to exclude weird
    /// punctuation or diacritics here; the field cleaners handle that.
    #[instrument(level = "debug", skip_all)]
    pub async fn recognize(&self, image: &DynamicImage) -> Result<String, ExtractError> {
        self.recognize_inner(image)
            .await
            .map_err(|err| ExtractError::OcrFailure(format!("{err:#}")))
    }

    async fn recognize_inner(&self, image: &DynamicImage) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        image
            .save(&input_path)
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file. If we time out below, dropping
        // the future must also kill the child, or it would keep running
        // against a temp directory we are about to delete.
        let run = Command::new(&self.command)
            .kill_on_drop(true)
            .arg(&input_path)
            .arg(output_path.with_extension(""))
            .arg("--oem")
            .arg(self.engine_mode.to_string())
            .arg("--dpi")
            .arg(self.dpi.to_string())
            .arg("-l")
            .arg(&self.language)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                anyhow::anyhow!("timed out after {}s", self.timeout.as_secs())
            })?
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        // Read the output file.
        std::fs::read_to_string(&output_path).context("cannot read tesseract output file")
    }
}
