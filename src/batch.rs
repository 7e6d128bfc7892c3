//! Batch orchestration: drive extraction from the registry and write the
//! output ledger.
//!
//! The ledger contains exactly one row per distinct registry pair, in
//! input order, no matter what goes wrong with any individual document.
//! Extraction failures become a `FAIL: <message>` note on the row; only
//! registry or ledger I/O problems abort the run.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _};
use tokio::io::AsyncWrite;

use crate::{
    address::{self, FieldResult},
    boxes::{BoxLocalizer, detect::BoxDetector},
    cmd::StreamOpts,
    config::ExtractConfig,
    demand,
    ocr::OcrAdapter,
    prelude::*,
    registry::{CaseWork, DocumentType, Registry, resolve_document_path},
    render::{PageRange, PageRenderer},
    ui::{ProgressConfig, Ui},
};

/// The columns we append to the registry's own columns, in ledger order.
pub const LEDGER_COLUMNS: [&str; 6] =
    ["demand_amount", "street", "city", "state", "zip", "Notes"];

/// The fields extracted from one document. Every field is optional; which
/// ones we even attempt depends on the document type.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ExtractedFields {
    /// The demand amount, in dollars. Complaints only.
    pub demand_amount: Option<f64>,

    /// Street address. Cover sheets only.
    pub street: Option<String>,

    /// City. Cover sheets only.
    pub city: Option<String>,

    /// State code. Cover sheets only.
    pub state: Option<String>,

    /// 5-digit zip code. Cover sheets only.
    pub zip: Option<String>,
}

/// One completed ledger row.
#[derive(Clone, Debug)]
pub struct CaseRecord {
    /// The full output row: registry columns plus [`LEDGER_COLUMNS`].
    pub row: Vec<String>,

    /// Did every expected field extract cleanly?
    pub passed: bool,
}

/// Everything a worker needs to process one case.
pub struct BatchContext {
    /// The run configuration.
    pub config: ExtractConfig,

    /// The directory holding the scanned documents.
    pub document_dir: PathBuf,

    /// The page renderer.
    pub renderer: PageRenderer,

    /// The OCR engine adapter.
    pub ocr: OcrAdapter,

    /// The box-detection collaborator for cover sheets.
    pub detector: Arc<dyn BoxDetector>,
}

impl BatchContext {
    /// Create a context with the default detection collaborator.
    pub fn new(config: ExtractConfig, document_dir: PathBuf) -> Self {
        let renderer = PageRenderer::new(&config);
        let ocr = OcrAdapter::new(&config);
        Self {
            config,
            document_dir,
            renderer,
            ocr,
            detector: Arc::new(crate::boxes::detect::ContourBoxDetector::default()),
        }
    }

    /// Extract the demand amount from a complaint.
    pub async fn demand_fields_from(
        &self,
        path: &Path,
    ) -> Result<ExtractedFields, ExtractError> {
        let pages = self
            .renderer
            .render(path, PageRange::through(self.config.demand.max_pages))
            .await?;
        let mut texts = vec![];
        for page in pages {
            let text = self.ocr.recognize(&page.image).await?;
            texts.push((page.page_number, text));
        }
        let found = demand::extract_demand(&texts, &self.config.demand)?;
        Ok(ExtractedFields {
            demand_amount: Some(found.amount),
            ..Default::default()
        })
    }

    /// Extract the mailing address from a civil case cover sheet.
    ///
    /// Returns the fields that did extract plus a message per field that
    /// did not, so a partially readable address still lands in the ledger.
    pub async fn address_fields_from(
        &self,
        path: &Path,
    ) -> Result<(ExtractedFields, Vec<String>), ExtractError> {
        let address_page = self.config.address.address_page;
        let pages = self
            .renderer
            .render(path, PageRange::from(address_page))
            .await?;
        // The address block is on the last page, which is usually the
        // configured page but occasionally later.
        let Some(page) = pages.into_iter().next_back() else {
            return Err(ExtractError::PatternNotFound(format!(
                "document has fewer than {address_page} pages"
            )));
        };

        let localizer = BoxLocalizer::new(&self.config, &*self.detector);
        let boxes = localizer.localize(&page);
        let results =
            address::extract_address_fields(&page, &boxes, &self.ocr, &self.config.address)
                .await;
        debug!(address = %address::compose_address(&results), "extracted address");
        Ok(collect_address_fields(&results))
    }

    async fn extract(&self, work: &CaseWork) -> (ExtractedFields, Vec<String>) {
        let Some(document_type) = work.document_type else {
            return (
                ExtractedFields::default(),
                vec![format!(
                    "unsupported document type {:?}",
                    work.document_label
                )],
            );
        };
        let path = match resolve_document_path(
            &self.document_dir,
            &work.case_number,
            document_type,
        ) {
            Ok(path) => path,
            Err(err) => return (ExtractedFields::default(), vec![err.to_string()]),
        };
        match document_type {
            DocumentType::Complaint => match self.demand_fields_from(&path).await {
                Ok(fields) => (fields, vec![]),
                Err(err) => (ExtractedFields::default(), vec![err.to_string()]),
            },
            DocumentType::CivilCaseCoverSheet => {
                match self.address_fields_from(&path).await {
                    Ok((fields, errors)) => (fields, errors),
                    Err(err) => (ExtractedFields::default(), vec![err.to_string()]),
                }
            }
        }
    }
}

/// Fold per-field results into the ledger fields plus failure messages.
fn collect_address_fields(results: &[FieldResult]) -> (ExtractedFields, Vec<String>) {
    use crate::boxes::FieldLabel;

    let mut fields = ExtractedFields::default();
    let mut errors = vec![];
    for result in results {
        match (&result.value, &result.error) {
            (Some(value), _) => {
                let slot = match result.label {
                    FieldLabel::Street => &mut fields.street,
                    FieldLabel::City => &mut fields.city,
                    FieldLabel::State => &mut fields.state,
                    FieldLabel::Zip => &mut fields.zip,
                };
                *slot = Some(value.clone());
            }
            (None, Some(message)) => {
                errors.push(format!("{}: {}", result.label, message));
            }
            (None, None) => {
                errors.push(format!("{}: missing", result.label));
            }
        }
    }
    (fields, errors)
}

/// Build the `Notes` value from the per-document failure messages.
fn compose_note(errors: &[String]) -> String {
    if errors.is_empty() {
        "PASS".to_owned()
    } else {
        format!("FAIL: {}", errors.join("; "))
    }
}

/// Process one registry work item. This never fails; every outcome is a
/// ledger row.
#[instrument(level = "debug", skip_all, fields(case = %work.case_number, document = %work.document_label))]
pub async fn process_case(ctx: Arc<BatchContext>, work: CaseWork) -> CaseRecord {
    let (fields, errors) = ctx.extract(&work).await;
    let note = compose_note(&errors);
    if !errors.is_empty() {
        debug!(case = %work.case_number, note = %note, "case failed");
    }

    let mut row = work.row;
    row.push(
        fields
            .demand_amount
            .map(|amount| format!("{amount:.2}"))
            .unwrap_or_default(),
    );
    row.push(fields.street.unwrap_or_default());
    row.push(fields.city.unwrap_or_default());
    row.push(fields.state.unwrap_or_default());
    row.push(fields.zip.unwrap_or_default());
    let passed = errors.is_empty();
    row.push(note);
    CaseRecord { row, passed }
}

/// Counters for a completed batch run.
#[derive(Clone, Debug, Default)]
pub struct BatchCounters {
    /// How many rows did we write?
    pub total_record_count: usize,

    /// How many rows carry a `FAIL` note?
    pub failure_count: usize,
}

impl BatchCounters {
    fn update(&mut self, record: &CaseRecord) {
        self.total_record_count += 1;
        if !record.passed {
            self.failure_count += 1;
        }
    }

    /// Display final counts and enforce the allowed failure rate.
    fn finish(&self, ui: &Ui, stream_opts: &StreamOpts) -> Result<()> {
        if self.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!(
                    "{} of {} documents could not be fully extracted",
                    self.failure_count, self.total_record_count
                ),
            );
        }
        let failure_rate = if self.total_record_count == 0 {
            0.0
        } else {
            self.failure_count as f32 / self.total_record_count as f32
        };
        if failure_rate > stream_opts.allowed_failure_rate {
            Err(anyhow::anyhow!(
                "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                self.failure_count,
                self.total_record_count,
                failure_rate * 100.0,
                stream_opts.allowed_failure_rate * 100.0
            ))
        } else {
            Ok(())
        }
    }
}

/// Run the whole batch: every registry pair in, one ledger row out, in the
/// same order.
pub async fn run_batch(
    ui: &Ui,
    registry: Registry,
    ctx: Arc<BatchContext>,
    stream_opts: &StreamOpts,
    output_path: Option<&Path>,
) -> Result<()> {
    let Registry { headers, cases } = registry;

    // Configure our progress bar.
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting fields",
            done_msg: "Extracted fields",
        },
        cases.len() as u64,
    );

    // Turn the work items into a stream of futures, and resolve a bounded
    // number of them at a time. `buffered` preserves input order.
    let input = stream_opts.apply_stream_input_opts(futures::stream::iter(cases).boxed());
    let futures = input
        .map(move |work| {
            let ctx = ctx.clone();
            async move { process_case(ctx, work).await }.boxed()
        })
        .boxed();
    let mut output = pb.wrap_stream(futures.buffered(stream_opts.job_count()));

    // Write the ledger as rows complete.
    let writer: Box<dyn AsyncWrite + Send + Unpin> = match output_path {
        Some(path) => Box::new(tokio::fs::File::create(path).await.with_context(|| {
            format!("failed to create ledger {:?}", path.display())
        })?),
        None => Box::new(tokio::io::stdout()),
    };
    let mut csv = csv_async::AsyncWriterBuilder::new().create_writer(writer);
    let mut out_headers = headers;
    out_headers.extend(LEDGER_COLUMNS.iter().map(|c| (*c).to_owned()));
    csv.write_record(&out_headers)
        .await
        .context("failed to write ledger headers")?;

    let mut counters = BatchCounters::default();
    while let Some(record) = output.next().await {
        counters.update(&record);
        csv.write_record(&record.row)
            .await
            .context("failed to write ledger row")?;
    }
    csv.flush().await.context("failed to flush ledger")?;

    counters.finish(ui, stream_opts)
}
