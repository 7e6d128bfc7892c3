//! The case registry: input CSV parsing and document file resolution.
//!
//! The registry is a CSV with at least `case_number` and `Document`
//! columns, plus arbitrary passthrough columns which we carry into the
//! output ledger untouched.

use std::collections::HashSet;

use futures::StreamExt as _;
use tokio::io::AsyncRead;

use crate::prelude::*;

/// The registry column naming the case.
const CASE_NUMBER_COLUMN: &str = "case_number";

/// The registry column naming the document type.
const DOCUMENT_COLUMN: &str = "Document";

/// The two document types we know how to extract fields from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    /// Early pages carry the monetary demand statement.
    Complaint,

    /// The final page carries the structured address boxes.
    CivilCaseCoverSheet,
}

impl DocumentType {
    /// Parse a registry `Document` label.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "Complaint" => Some(Self::Complaint),
            "Civil Case Cover Sheet" => Some(Self::CivilCaseCoverSheet),
            _ => None,
        }
    }

    /// Human-readable label, matching the registry column values.
    pub fn label(self) -> &'static str {
        match self {
            Self::Complaint => "Complaint",
            Self::CivilCaseCoverSheet => "Civil Case Cover Sheet",
        }
    }

    /// The lowercase token that appears in scanned file names.
    pub fn file_slug(self) -> &'static str {
        match self {
            Self::Complaint => "complaint",
            Self::CivilCaseCoverSheet => "civil_case_cover_sheet",
        }
    }
}

/// One case/document pair to process, with its original registry row.
#[derive(Clone, Debug)]
pub struct CaseWork {
    /// The case identifier, alphanumeric.
    pub case_number: String,

    /// The parsed document type, or `None` for labels we do not handle.
    pub document_type: Option<DocumentType>,

    /// The raw `Document` column value, kept for the ledger.
    pub document_label: String,

    /// All column values from the first registry row for this pair.
    pub row: Vec<String>,
}

/// A parsed registry: headers plus one work item per distinct
/// `(case_number, document_type)` pair, in first-occurrence order.
#[derive(Debug)]
pub struct Registry {
    /// The input CSV headers, in order.
    pub headers: Vec<String>,

    /// The distinct work items.
    pub cases: Vec<CaseWork>,
}

impl Registry {
    /// Read a registry from a CSV file, or from standard input.
    pub async fn read(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let file = tokio::fs::File::open(path).await.with_context(|| {
                    format!("failed to open registry {:?}", path.display())
                })?;
                Self::read_from(file).await.with_context(|| {
                    format!("failed to read registry {:?}", path.display())
                })
            }
            None => Self::read_from(tokio::io::stdin())
                .await
                .context("failed to read registry from stdin"),
        }
    }

    /// Read a registry from any async reader.
    pub async fn read_from(
        reader: impl AsyncRead + Unpin + Send + Sync,
    ) -> Result<Self> {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = reader
            .headers()
            .await
            .context("failed to read CSV headers")?
            .iter()
            .map(|h| h.to_owned())
            .collect::<Vec<_>>();

        let case_idx = headers
            .iter()
            .position(|h| h == CASE_NUMBER_COLUMN)
            .with_context(|| format!("registry has no {CASE_NUMBER_COLUMN:?} column"))?;
        let document_idx = headers
            .iter()
            .position(|h| h == DOCUMENT_COLUMN)
            .with_context(|| format!("registry has no {DOCUMENT_COLUMN:?} column"))?;

        // Reduce to distinct (case_number, Document) pairs, preserving the
        // order in which they first appear. The ledger must contain exactly
        // one row per pair, so no case is silently dropped.
        let mut seen = HashSet::new();
        let mut cases = vec![];
        let mut records = reader.into_records();
        while let Some(record) = records.next().await {
            let record = record.context("failed to read registry record")?;
            let row = record.iter().map(|v| v.to_owned()).collect::<Vec<_>>();
            let case_number = row.get(case_idx).cloned().unwrap_or_default();
            let document_label = row.get(document_idx).cloned().unwrap_or_default();
            if !seen.insert((case_number.clone(), document_label.clone())) {
                continue;
            }
            cases.push(CaseWork {
                document_type: DocumentType::from_label(&document_label),
                case_number,
                document_label,
                row,
            });
        }

        Ok(Self { headers, cases })
    }
}

/// Resolve the scanned file for a case via the naming convention: the file
/// name starts with the case number and contains the document-type slug,
/// case-insensitively. Complaints must not match their summons.
pub fn resolve_document_path(
    document_dir: &Path,
    case_number: &str,
    document_type: DocumentType,
) -> Result<PathBuf, ExtractError> {
    let case_number = case_number.to_lowercase();
    let slug = document_type.file_slug();

    let entries = std::fs::read_dir(document_dir).map_err(|err| {
        ExtractError::FileNotFound(format!(
            "could not list document directory {:?}: {err}",
            document_dir.display()
        ))
    })?;

    let mut matches = vec![];
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.starts_with(&case_number) || !name.contains(slug) {
            continue;
        }
        // A "summons_on_complaint" scan also contains the complaint slug.
        if document_type == DocumentType::Complaint && name.contains("summons_on_complaint")
        {
            continue;
        }
        matches.push(entry.path());
    }
    matches.sort();

    match matches.len() {
        0 => Err(ExtractError::FileNotFound(format!(
            "could not find {} for case {}",
            document_type.label(),
            case_number
        ))),
        1 => Ok(matches.remove(0)),
        n => Err(ExtractError::FileNotFound(format!(
            "found {n} {} files for case {}",
            document_type.label(),
            case_number
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_keeps_distinct_pairs_in_order() {
        let csv = "\
case_number,Document,Filed
21stcv01234,Complaint,2021-01-04
21stcv01234,Civil Case Cover Sheet,2021-01-04
21stcv01234,Complaint,2021-01-05
21stcv05678,Complaint,2021-02-01
";
        let registry = Registry::read_from(csv.as_bytes()).await.unwrap();
        assert_eq!(registry.headers, vec!["case_number", "Document", "Filed"]);
        assert_eq!(registry.cases.len(), 3);
        assert_eq!(registry.cases[0].case_number, "21stcv01234");
        assert_eq!(
            registry.cases[0].document_type,
            Some(DocumentType::Complaint)
        );
        // The duplicate complaint row was dropped; the first row's
        // passthrough values survive.
        assert_eq!(registry.cases[0].row[2], "2021-01-04");
        assert_eq!(
            registry.cases[1].document_type,
            Some(DocumentType::CivilCaseCoverSheet)
        );
        assert_eq!(registry.cases[2].case_number, "21stcv05678");
    }

    #[tokio::test]
    async fn unknown_document_labels_are_kept() {
        let csv = "case_number,Document\n21stcv01234,Summons on Complaint\n";
        let registry = Registry::read_from(csv.as_bytes()).await.unwrap();
        assert_eq!(registry.cases.len(), 1);
        assert_eq!(registry.cases[0].document_type, None);
        assert_eq!(registry.cases[0].document_label, "Summons on Complaint");
    }

    #[tokio::test]
    async fn missing_case_column_is_fatal() {
        let csv = "id,Document\n1,Complaint\n";
        assert!(Registry::read_from(csv.as_bytes()).await.is_err());
    }

    #[test]
    fn resolves_exactly_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| std::fs::write(dir.path().join(name), b"%PDF").unwrap();
        touch("21STCV01234_complaint.pdf");
        touch("21STCV01234_summons_on_complaint.pdf");
        touch("21STCV01234_civil_case_cover_sheet.pdf");
        touch("21STCV05678_complaint.pdf");

        let path =
            resolve_document_path(dir.path(), "21stcv01234", DocumentType::Complaint)
                .unwrap();
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .eq_ignore_ascii_case("21STCV01234_complaint.pdf")
        );

        let err = resolve_document_path(dir.path(), "21stcv09999", DocumentType::Complaint)
            .unwrap_err();
        assert!(err.to_string().contains("could not find Complaint"));
    }

    #[test]
    fn multiple_matches_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("21stcv01234_complaint.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("21stcv01234_complaint_amended.pdf"), b"%PDF")
            .unwrap();
        let err = resolve_document_path(dir.path(), "21stcv01234", DocumentType::Complaint)
            .unwrap_err();
        assert!(err.to_string().contains("found 2"));
    }
}
