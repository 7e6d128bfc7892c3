//! Extraction configuration.
//!
//! Everything tunable lives in one [`ExtractConfig`], constructed once at
//! process start and passed explicitly into the components that need it.
//! Defaults match the scanned Los Angeles County forms this tool was built
//! for; a `--config` file (TOML or JSON) can override any section for other
//! jurisdictions or scan resolutions.

use serde::Deserialize;
use tokio::fs;

use crate::prelude::*;

/// Top-level configuration for an extraction run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// OCR engine settings.
    pub ocr: OcrConfig,

    /// Page rasterization settings.
    pub render: RenderConfig,

    /// Rotation search settings for box localization.
    pub rotation: RotationConfig,

    /// Expected field-box geometry on the cover-sheet address page.
    pub boxes: BoxesConfig,

    /// Demand template settings.
    pub demand: DemandConfig,

    /// Address cleaning and validation settings.
    pub address: AddressConfig,
}

impl ExtractConfig {
    /// Load configuration from an optional TOML or JSON file, falling back
    /// to the built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {:?}", path.display()))?;
        // JSON files start with `{`; everything else is treated as TOML.
        if data.trim_start().starts_with('{') {
            serde_json::from_str(&data).with_context(|| {
                format!("failed to parse JSON config {:?}", path.display())
            })
        } else {
            toml::from_str(&data).with_context(|| {
                format!("failed to parse TOML config {:?}", path.display())
            })
        }
    }
}

/// Settings for the `tesseract` CLI tool.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrConfig {
    /// The OCR command to run. Override if `tesseract` is not on `PATH`.
    pub command: String,

    /// Recognition language.
    pub language: String,

    /// OCR engine mode (`--oem`). Mode 1 is the LSTM engine.
    pub engine_mode: u32,

    /// Seconds to wait before treating a recognition call as failed.
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            command: "tesseract".to_owned(),
            language: "eng".to_owned(),
            engine_mode: 1,
            timeout_secs: 120,
        }
    }
}

/// Settings for PDF rasterization.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    /// Rasterization resolution. Tesseract works best around 300 DPI.
    pub dpi: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { dpi: 300 }
    }
}

/// Bounded rotation search used by the box localizer.
///
/// Box detection on scanned forms is extremely sensitive to skew (well
/// under half a degree), so we retry detection at small alternating
/// rotations. The attempt count is a hard cap; there is no unbounded
/// retry anywhere in the pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotationConfig {
    /// Degrees between successive attempts.
    pub step_degrees: f32,

    /// Maximum number of detection attempts, including the unrotated one.
    /// The default covers ±2° at 0.1° steps.
    pub max_attempts: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            step_degrees: 0.1,
            max_attempts: 41,
        }
    }
}

/// An expected size range for one field box, in pixels at the configured
/// render DPI.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoxSpec {
    /// Inclusive (min, max) box width.
    pub width: (u32, u32),

    /// Inclusive (min, max) box height.
    pub height: (u32, u32),

    /// Inclusive (min, max) width/height ratio.
    pub aspect: (f32, f32),
}

impl BoxSpec {
    /// Does a candidate of this size fall within tolerance?
    pub fn matches(&self, width: u32, height: u32) -> bool {
        if height == 0 {
            return false;
        }
        let aspect = width as f32 / height as f32;
        width >= self.width.0
            && width <= self.width.1
            && height >= self.height.0
            && height <= self.height.1
            && aspect >= self.aspect.0
            && aspect <= self.aspect.1
    }

    /// How far a candidate's size is from the center of the expected range.
    /// Lower is better; used to pick between multiple in-tolerance boxes.
    pub fn deviation(&self, width: u32, height: u32) -> u32 {
        let mid_w = (self.width.0 + self.width.1) / 2;
        let mid_h = (self.height.0 + self.height.1) / 2;
        width.abs_diff(mid_w) + height.abs_diff(mid_h)
    }
}

/// Expected geometry of the address field boxes on the last cover-sheet
/// page. All pixel values assume 300 DPI.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoxesConfig {
    /// Pixels cropped off the top of the page before detection. There is a
    /// box near the top edge that otherwise gets confused for the street
    /// address box.
    pub top_margin: u32,

    /// The address block sits in the upper half of the page; the rest is
    /// cropped away to keep rotation cheap.
    pub keep_fraction: f32,

    /// Pixels cropped off the left side when searching for the street box,
    /// to remove the REASON box in the left column.
    pub street_left_crop: u32,

    /// Expected street address box size.
    pub street: BoxSpec,

    /// Expected city box size.
    pub city: BoxSpec,

    /// Expected state box size.
    pub state: BoxSpec,

    /// Expected zip code box size.
    pub zip: BoxSpec,
}

impl Default for BoxesConfig {
    fn default() -> Self {
        Self {
            top_margin: 300,
            keep_fraction: 0.5,
            street_left_crop: 1000,
            street: BoxSpec {
                width: (800, 1500),
                height: (150, 500),
                aspect: (0.5, 12.0),
            },
            city: BoxSpec {
                width: (250, 850),
                height: (90, 210),
                aspect: (1.5, 7.0),
            },
            state: BoxSpec {
                width: (150, 450),
                height: (90, 210),
                aspect: (0.6, 5.0),
            },
            zip: BoxSpec {
                width: (150, 450),
                height: (90, 210),
                aspect: (0.6, 5.0),
            },
        }
    }
}

/// The demand template matchers, in priority order.
///
/// Each kind corresponds to one form layout we have seen in the wild.
/// See [`crate::demand`] for the regexes each kind expands to.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// `DEMAND: $…` (first-page caption box).
    DemandLabel,
    /// `DEMAND AMOUNT: $…`.
    DemandAmountLabel,
    /// `AMOUNT OF DEMAND: $…`.
    AmountOfDemandLabel,
    /// `PRAYER AMOUNT: $…`.
    PrayerAmountLabel,
    /// Page-2 `…damages of: $…` (the "Plaintiff prays" clause).
    DamagesOf,
    /// Page-3 `For damages of $…`.
    ForDamagesOf,
}

/// Settings for demand extraction from complaints.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemandConfig {
    /// How many leading pages of the complaint to scan.
    pub max_pages: usize,

    /// Templates to try, in priority order. The first match anywhere wins.
    pub templates: Vec<TemplateKind>,

    /// Log a warning for demands above this amount; limited-jurisdiction
    /// cases should stay under it.
    pub warn_above: f64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            // Specific labels come before the bare DEMAND label, which
            // would otherwise match inside "AMOUNT OF DEMAND".
            templates: vec![
                TemplateKind::DemandAmountLabel,
                TemplateKind::AmountOfDemandLabel,
                TemplateKind::PrayerAmountLabel,
                TemplateKind::DemandLabel,
                TemplateKind::DamagesOf,
                TemplateKind::ForDamagesOf,
            ],
            warn_above: 25_000.0,
        }
    }
}

/// Settings for address field cleaning and validation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddressConfig {
    /// The cover-sheet page (1-based) on which the address block usually
    /// appears. Occasionally it is on a later page, so we render from here
    /// to the end and take the last page.
    pub address_page: usize,

    /// Two-letter state codes accepted by validation.
    pub state_codes: Vec<String>,

    /// Optional known-city list; when present, cleaned city values must
    /// match one of these (case-insensitive).
    pub known_cities: Option<Vec<String>>,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            address_page: 6,
            state_codes: US_STATE_CODES.iter().map(|s| (*s).to_owned()).collect(),
            known_cities: None,
        }
    }
}

/// The 50 USPS state codes plus DC.
const US_STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DC", "DE", "FL", "GA", "HI", "ID", "IL",
    "IN", "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE",
    "NV", "NH", "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD",
    "TN", "TX", "UT", "VT", "VA", "WA", "WV", "WI", "WY",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_templates() {
        let config = ExtractConfig::default();
        assert_eq!(config.demand.templates.len(), 6);
        assert_eq!(config.render.dpi, 300);
        assert_eq!(config.rotation.max_attempts, 41);
    }

    #[test]
    fn box_spec_tolerance_and_deviation() {
        let spec = BoxSpec {
            width: (250, 850),
            height: (90, 210),
            aspect: (1.5, 7.0),
        };
        assert!(spec.matches(500, 150));
        // Too narrow.
        assert!(!spec.matches(200, 150));
        // Aspect ratio out of range even though width and height fit.
        assert!(!spec.matches(260, 200));
        // Closer to the range center scores lower.
        assert!(spec.deviation(550, 150) < spec.deviation(300, 100));
    }

    #[test]
    fn config_parses_from_toml() {
        let toml = r#"
            [ocr]
            command = "/opt/tesseract/bin/tesseract"

            [demand]
            max_pages = 2
            templates = ["demand_label", "prayer_amount_label"]
        "#;
        let config: ExtractConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.ocr.command, "/opt/tesseract/bin/tesseract");
        assert_eq!(config.demand.max_pages, 2);
        assert_eq!(config.demand.templates.len(), 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.render.dpi, 300);
    }
}
