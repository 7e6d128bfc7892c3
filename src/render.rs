//! Page rendering: PDF pages to raster images, using Poppler's
//! `pdftocairo` CLI tool.
//!
//! Rasterized pages at OCR resolution are large (a letter page at 300 DPI
//! is ~25 MB decoded), so callers should drop each [`PageImage`] as soon as
//! the consuming extraction step is done with it. The temporary directory
//! holding the intermediate PNGs is scoped to a single [`render`] call.

use std::{collections::BTreeMap, sync::LazyLock};

use image::DynamicImage;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure},
    config::ExtractConfig,
    prelude::*,
};

/// Poppler writes some recoverable complaints to stderr with a zero exit
/// code; treat real errors as failures but let known-benign ones through.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_output(output: &str) -> bool {
    output.lines().any(|line| {
        DEFAULT_ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
    })
}

/// An inclusive 1-based page range to render.
#[derive(Clone, Copy, Debug, Default)]
pub struct PageRange {
    /// First page to render, if not the first page of the document.
    pub first: Option<usize>,

    /// Last page to render, if not the last page of the document.
    pub last: Option<usize>,
}

impl PageRange {
    /// Render from `first` to the end of the document.
    pub fn from(first: usize) -> Self {
        Self {
            first: Some(first),
            last: None,
        }
    }

    /// Render from the start of the document through `last`.
    pub fn through(last: usize) -> Self {
        Self {
            first: None,
            last: Some(last),
        }
    }
}

/// One rendered page.
#[derive(Debug)]
pub struct PageImage {
    /// 1-based page number within the source document.
    pub page_number: usize,

    /// The decoded raster image.
    pub image: DynamicImage,

    /// The resolution this page was rendered at.
    pub dpi: u32,
}

/// Renders PDF pages to images at a fixed resolution.
#[derive(Clone, Debug)]
pub struct PageRenderer {
    dpi: u32,
}

impl PageRenderer {
    /// Create a renderer from the run configuration.
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            dpi: config.render.dpi,
        }
    }

    /// The resolution this renderer produces.
    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Render the selected pages of `path` to images.
    ///
    /// Returns an empty vector when `range.first` is past the end of the
    /// document (some cover sheets are short and simply lack the address
    /// page). Fails with [`ExtractError::FileNotFound`] for a missing file
    /// and [`ExtractError::Render`] for anything Poppler cannot decode.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn render(
        &self,
        path: &Path,
        range: PageRange,
    ) -> Result<Vec<PageImage>, ExtractError> {
        if !path.is_file() {
            return Err(ExtractError::FileNotFound(format!(
                "file not found: {:?}",
                path.display()
            )));
        }
        let mime_type = infer::get_from_path(path)
            .map_err(|err| ExtractError::render(path, err.to_string()))?
            .map(|kind| kind.mime_type())
            .unwrap_or("application/octet-stream");
        if mime_type != "application/pdf" {
            return Err(ExtractError::render(
                path,
                format!("expected a PDF, found {mime_type}"),
            ));
        }

        let total_pages = get_pdf_page_count(path)
            .await
            .map_err(|err| ExtractError::render(path, format!("{err:#}")))?;
        let first = range.first.unwrap_or(1);
        let last = range.last.unwrap_or(total_pages).min(total_pages);
        if first > last {
            return Ok(vec![]);
        }

        self.rasterize(path, first, last)
            .await
            .map_err(|err| ExtractError::render(path, format!("{err:#}")))
    }

    /// Run `pdftocairo` and decode its PNG output.
    async fn rasterize(
        &self,
        path: &Path,
        first: usize,
        last: usize,
    ) -> Result<Vec<PageImage>> {
        // pdftocairo appends page digits to this prefix.
        let filename = path
            .file_name()
            .context("failed to get filename from PDF path")?;
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_path = tmpdir.path().join(filename).with_extension("png");

        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg(first.to_string())
            .arg("-l")
            .arg(last.to_string())
            .arg(path)
            .arg(out_path)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))?;
        check_for_command_failure("pdftocairo", &output, None)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_error_output(&stderr) {
            return Err(anyhow::anyhow!("pdftocairo printed error output:\n{stderr}"));
        }

        // pdftocairo numbers output files from the requested first page, so
        // lexical order is page order.
        let mut page_paths = tmpdir
            .path()
            .read_dir()
            .context("failed to read rendered page directory")?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>>>()?;
        page_paths.sort();

        let mut pages = vec![];
        for (idx, page_path) in page_paths.into_iter().enumerate() {
            let image = image::open(&page_path).with_context(|| {
                format!("failed to decode rendered page {:?}", page_path.display())
            })?;
            // Delete the file to recover space a bit early.
            std::fs::remove_file(&page_path).with_context(|| {
                format!("failed to delete {:?}", page_path.display())
            })?;
            pages.push(PageImage {
                page_number: first + idx,
                image,
                dpi: self.dpi,
            });
        }
        Ok(pages)
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    // Run pdfinfo to get the number of pages.
    let mut cmd = Command::new("pdfinfo");
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    // Parse the output of pdfinfo into properties.
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }

    // Get the number of pages from the properties.
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow::anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_output_detection() {
        assert!(is_error_output("Syntax Error: couldn't read xref table"));
        assert!(!is_error_output("Syntax Warning: dict is shorter than expected"));
        assert!(!is_error_output(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[tokio::test]
    async fn missing_file_is_file_not_found() {
        let config = ExtractConfig::default();
        let renderer = PageRenderer::new(&config);
        let err = renderer
            .render(Path::new("/no/such/file.pdf"), PageRange::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn non_pdf_is_a_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        // A PNG header, not a PDF.
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n0000000000").unwrap();
        let config = ExtractConfig::default();
        let renderer = PageRenderer::new(&config);
        let err = renderer.render(&path, PageRange::default()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Render { .. }));
        assert!(err.to_string().contains("expected a PDF"));
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn renders_selected_pages() {
        let config = ExtractConfig::default();
        let renderer = PageRenderer::new(&config);
        let pages = renderer
            .render(
                Path::new("tests/fixtures/two_pages.pdf"),
                PageRange::through(1),
            )
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, 1);
        assert_eq!(pages[0].dpi, 300);
    }
}
