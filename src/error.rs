//! The extraction error taxonomy.
//!
//! Everything in here is recoverable at the per-case (demand) or per-field
//! (address) boundary: the batch orchestrator converts these into blank
//! values plus a `FAIL: <message>` note and keeps going. Registry and
//! ledger I/O failures are *not* represented here; those stay
//! [`anyhow::Error`] and abort the run.

use thiserror::Error;

/// An error produced while extracting fields from a single document.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The naming convention did not resolve to exactly one file.
    #[error("{0}")]
    FileNotFound(String),

    /// The PDF could not be rendered to page images.
    #[error("could not render {path}: {message}")]
    Render { path: String, message: String },

    /// The OCR engine failed or timed out.
    #[error("OCR failed: {0}")]
    OcrFailure(String),

    /// No template or field box matched within the search scope.
    #[error("{0}")]
    PatternNotFound(String),

    /// A matched substring did not normalize to a number.
    #[error("could not parse {0:?} as a monetary amount")]
    Parse(String),

    /// A cleaned field value failed its format check.
    #[error("invalid {field}: {value:?}")]
    Validation { field: &'static str, value: String },
}

impl ExtractError {
    /// The demand templates matched nothing on any scanned page.
    pub fn no_pattern() -> Self {
        ExtractError::PatternNotFound("no pattern matched".to_owned())
    }

    /// No candidate box fell within tolerance for a field label.
    pub fn box_not_found(label: &str, max_degrees: f32) -> Self {
        ExtractError::PatternNotFound(format!(
            "could not detect {label} box within ±{max_degrees} degrees of rotation"
        ))
    }

    /// A render-stage failure with a path for context.
    pub fn render(path: &std::path::Path, message: impl Into<String>) -> Self {
        ExtractError::Render {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pattern_message_is_stable() {
        // The batch orchestrator writes this verbatim into the `Notes`
        // column, and downstream review tooling matches on it.
        assert_eq!(ExtractError::no_pattern().to_string(), "no pattern matched");
    }

    #[test]
    fn validation_message_names_the_field() {
        let err = ExtractError::Validation {
            field: "zip",
            value: "1234".to_owned(),
        };
        assert_eq!(err.to_string(), "invalid zip: \"1234\"");
    }
}
