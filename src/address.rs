//! Address field extraction: OCR each localized box and clean the text.
//!
//! Each crop holds a header token ("ADDRESS:", "CITY:", …) followed by the
//! handwritten or typed value, and OCR adds its usual noise on top. The
//! cleaners strip the header (including misreadings we have seen in
//! production scans), drop diacritics and stray punctuation, and validate
//! the remainder per field. A field that fails validation is blanked on
//! its own; it never takes the rest of the address down with it.

use std::{collections::BTreeMap, sync::LazyLock};

use image::{DynamicImage, GenericImageView};
use regex::Regex;
use serde::Serialize;

use crate::{
    boxes::{BoxRect, FieldBox, FieldLabel},
    config::AddressConfig,
    ocr::OcrAdapter,
    prelude::*,
    render::PageImage,
};

/// Header tokens (and observed OCR misreadings) per field.
fn header_tokens(label: FieldLabel) -> &'static [&'static str] {
    match label {
        FieldLabel::Street => &["ADDRESS", "ADORESS", "AOORESS", "AODRESS"],
        FieldLabel::City => &["CITY", "CHY"],
        FieldLabel::State => &["STATE"],
        // ZIP and CODE are stripped separately; the space between them is
        // often lost.
        FieldLabel::Zip => &["ZIP"],
    }
}

/// Extra pixels around each crop: tight crops hurt OCR accuracy. The zip
/// box gets extra bottom padding because zip codes occasionally wrap to a
/// second line.
fn crop_padding(label: FieldLabel) -> (u32, u32, u32, u32) {
    // (left, top, right, bottom)
    match label {
        FieldLabel::Street => (30, 30, 30, 30),
        FieldLabel::City => (50, 10, 10, 10),
        FieldLabel::State => (10, 10, 10, 10),
        FieldLabel::Zip => (10, 10, 10, 40),
    }
}

/// Leading alphabetic noise (usually the defendant's name) before the
/// house number of a street address.
static STREET_NAME_FILTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z\s]*(\d.*)").expect("failed to compile regex"));

/// The outcome of extracting one address field.
#[derive(Clone, Debug, Serialize)]
pub struct FieldResult {
    /// Which field this is.
    pub label: FieldLabel,

    /// The cleaned, validated value; `None` exactly when `error` is set.
    pub value: Option<String>,

    /// Why the field is blank, if it is.
    pub error: Option<String>,
}

impl FieldResult {
    fn ok(label: FieldLabel, value: String) -> Self {
        Self {
            label,
            value: Some(value),
            error: None,
        }
    }
}

/// Extract all address fields from a page, given the localized boxes.
///
/// Boxes that could not be localized arrive as errors and simply become
/// blank fields; localized boxes are cropped, OCRed and cleaned one at a
/// time, dropping each crop before the next is made.
#[instrument(level = "debug", skip_all, fields(page = page.page_number))]
pub async fn extract_address_fields(
    page: &PageImage,
    boxes: &BTreeMap<FieldLabel, Result<FieldBox, ExtractError>>,
    ocr: &OcrAdapter,
    config: &AddressConfig,
) -> Vec<FieldResult> {
    let mut results = vec![];
    for label in FieldLabel::ALL {
        let result = match boxes.get(&label) {
            Some(Ok(field_box)) => {
                extract_one_field(page, field_box, ocr, config).await
            }
            Some(Err(err)) => Err(err.to_string()),
            None => Err(format!("no {label} box")),
        };
        results.push(match result {
            Ok(value) => FieldResult::ok(label, value),
            Err(message) => FieldResult {
                label,
                value: None,
                error: Some(message),
            },
        });
    }
    results
}

/// Crop, OCR, clean and validate a single field.
async fn extract_one_field(
    page: &PageImage,
    field_box: &FieldBox,
    ocr: &OcrAdapter,
    config: &AddressConfig,
) -> Result<String, String> {
    let crop = crop_field(&page.image, &field_box.rect, field_box.label);
    let text = ocr
        .recognize(&crop)
        .await
        .map_err(|err| err.to_string())?;
    drop(crop);
    clean_field(field_box.label, &text, config).map_err(|err| err.to_string())
}

/// Crop a field region with padding, clamped to the page bounds.
pub fn crop_field(page: &DynamicImage, rect: &BoxRect, label: FieldLabel) -> DynamicImage {
    let (pad_left, pad_top, pad_right, pad_bottom) = crop_padding(label);
    let (page_width, page_height) = page.dimensions();
    let x = rect.x.saturating_sub(pad_left);
    let y = rect.y.saturating_sub(pad_top);
    let right = (rect.x + rect.width + pad_right).min(page_width);
    let bottom = (rect.y + rect.height + pad_bottom).min(page_height);
    page.crop_imm(x, y, right - x, bottom - y)
}

/// Clean OCR text for a field and validate its format.
pub fn clean_field(
    label: FieldLabel,
    raw: &str,
    config: &AddressConfig,
) -> Result<String, ExtractError> {
    // Diacritics and other non-ASCII are always OCR artifacts here.
    let mut text: String = raw.chars().filter(char::is_ascii).collect();
    text = text.trim().to_owned();

    // Strip the header token, if the OCR picked it up.
    for token in header_tokens(label) {
        if let Some(idx) = text.to_uppercase().find(token) {
            text = text[idx + token.len()..].to_owned();
            break;
        }
    }
    if label == FieldLabel::Zip {
        // The space between ZIP and CODE is often not recognized, so CODE
        // is stripped in a separate step.
        let trimmed = text.trim_start();
        if let Some(idx) = trimmed.to_uppercase().find("CODE") {
            text = trimmed[idx + "CODE".len()..].to_owned();
        }
    }

    // The OCR often misreads the header's colon, or misses it entirely.
    let text = text
        .trim_start_matches([':', ';', ',', '.', '\''])
        .trim()
        .to_owned();

    match label {
        FieldLabel::Street => clean_street(&text),
        FieldLabel::City => clean_city(&text, config),
        FieldLabel::State => clean_state(&text, config),
        FieldLabel::Zip => clean_zip(&text),
    }
}

fn validation_error(field: &'static str, value: &str) -> ExtractError {
    ExtractError::Validation {
        field,
        value: value.to_owned(),
    }
}

fn clean_street(text: &str) -> Result<String, ExtractError> {
    // Drop a leading defendant name; street addresses start with the
    // building number.
    let street = match STREET_NAME_FILTER.captures(text) {
        Some(captures) => captures
            .get(1)
            .expect("street filter has one capture group")
            .as_str()
            .trim()
            .to_owned(),
        None => text.trim().to_owned(),
    };
    if street.is_empty() {
        return Err(validation_error("street", text));
    }
    Ok(street)
}

fn clean_city(text: &str, config: &AddressConfig) -> Result<String, ExtractError> {
    let city = text.trim();
    if city.is_empty() || !city.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return Err(validation_error("city", text));
    }
    if let Some(known) = &config.known_cities
        && !known.iter().any(|k| k.eq_ignore_ascii_case(city))
    {
        return Err(validation_error("city", text));
    }
    Ok(city.to_owned())
}

fn clean_state(text: &str, config: &AddressConfig) -> Result<String, ExtractError> {
    let state: String = text
        .chars()
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if state.len() != 2 || !config.state_codes.iter().any(|code| code == &state) {
        return Err(validation_error("state", text));
    }
    Ok(state)
}

fn clean_zip(text: &str) -> Result<String, ExtractError> {
    // Keep the first five digits; the +4 suffix is frequently garbled and
    // is not needed to geolocate the address, so it is discarded.
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 5 || !compact.is_char_boundary(5) {
        return Err(validation_error("zip", text));
    }
    let zip5 = &compact[..5];
    if !zip5.bytes().all(|b| b.is_ascii_digit()) {
        return Err(validation_error("zip", text));
    }
    Ok(zip5.to_owned())
}

/// Compose the final address string from whichever fields succeeded.
pub fn compose_address(fields: &[FieldResult]) -> String {
    let get = |label: FieldLabel| {
        fields
            .iter()
            .find(|f| f.label == label)
            .and_then(|f| f.value.as_deref())
            .unwrap_or("")
    };
    let street = get(FieldLabel::Street);
    let tail = [get(FieldLabel::City), get(FieldLabel::State), get(FieldLabel::Zip)]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ");
    match (street.is_empty(), tail.is_empty()) {
        (false, false) => format!("{street}, {tail}"),
        (false, true) => street.to_owned(),
        (true, _) => tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AddressConfig {
        AddressConfig::default()
    }

    #[test]
    fn street_strips_header_and_name() {
        let cleaned = clean_field(
            FieldLabel::Street,
            "ADDRESS:\nJohn Q Defendant\n123 Main St, Apt 4\n",
            &config(),
        )
        .unwrap();
        assert_eq!(cleaned, "123 Main St, Apt 4");
    }

    #[test]
    fn street_tolerates_header_typos() {
        let cleaned =
            clean_field(FieldLabel::Street, "ADORESS; 950 Grand Ave", &config()).unwrap();
        assert_eq!(cleaned, "950 Grand Ave");
    }

    #[test]
    fn city_strips_header_and_validates() {
        let cleaned =
            clean_field(FieldLabel::City, "CITY: Los Angeles\n", &config()).unwrap();
        assert_eq!(cleaned, "Los Angeles");

        // Digits in a city mean the wrong box was OCRed.
        let err = clean_field(FieldLabel::City, "CITY: 90012", &config()).unwrap_err();
        assert!(matches!(err, ExtractError::Validation { field: "city", .. }));
    }

    #[test]
    fn city_checked_against_known_list_when_configured() {
        let mut config = config();
        config.known_cities = Some(vec!["Los Angeles".to_owned(), "Glendale".to_owned()]);
        assert!(clean_field(FieldLabel::City, "CITY: glendale", &config).is_ok());
        assert!(clean_field(FieldLabel::City, "CITY: Springfield", &config).is_err());
    }

    #[test]
    fn state_uppercases_and_validates_against_allowed_set() {
        assert_eq!(
            clean_field(FieldLabel::State, "STATE: ca\n", &config()).unwrap(),
            "CA"
        );
        assert!(clean_field(FieldLabel::State, "STATE: ZZ", &config()).is_err());
        assert!(clean_field(FieldLabel::State, "STATE: CALIFORNIA", &config()).is_err());
    }

    #[test]
    fn zip_keeps_exactly_five_digits() {
        assert_eq!(
            clean_field(FieldLabel::Zip, "ZIP CODE: 90012\n", &config()).unwrap(),
            "90012"
        );
        // The +4 suffix is discarded.
        assert_eq!(
            clean_field(FieldLabel::Zip, "ZIPCODE: 90012-1234", &config()).unwrap(),
            "90012"
        );
        // Four digits is not a zip code.
        let err = clean_field(FieldLabel::Zip, "ZIP CODE: 9001", &config()).unwrap_err();
        assert!(matches!(err, ExtractError::Validation { field: "zip", .. }));
    }

    #[test]
    fn zip_sized_text_in_the_city_box_fails_only_city() {
        // The localizer mis-selected the zip box as the city box; the
        // digits fail city validation and the field is blanked, without
        // touching any other field.
        let city = clean_field(FieldLabel::City, "90012", &config());
        assert!(city.is_err());
        let zip = clean_field(FieldLabel::Zip, "ZIP CODE: 90012", &config());
        assert_eq!(zip.unwrap(), "90012");
    }

    #[test]
    fn diacritics_are_dropped() {
        let cleaned = clean_field(FieldLabel::City, "CITY: Cañada", &config());
        // The ASCII filter drops `ñ`, leaving a still-alphabetic token.
        assert_eq!(cleaned.unwrap(), "Caada");
    }

    #[test]
    fn compose_joins_non_empty_fields() {
        let fields = vec![
            FieldResult::ok(FieldLabel::Street, "123 Main St".to_owned()),
            FieldResult {
                label: FieldLabel::City,
                value: None,
                error: Some("no city box".to_owned()),
            },
            FieldResult::ok(FieldLabel::State, "CA".to_owned()),
            FieldResult::ok(FieldLabel::Zip, "90012".to_owned()),
        ];
        assert_eq!(compose_address(&fields), "123 Main St, CA 90012");
    }

    #[test]
    fn crop_padding_is_clamped_to_the_page() {
        let page = DynamicImage::new_luma8(1000, 800);
        let rect = BoxRect {
            x: 950,
            y: 10,
            width: 40,
            height: 40,
        };
        let crop = crop_field(&page, &rect, FieldLabel::Zip);
        // Padding cannot push the crop outside the page.
        assert!(crop.width() <= 1000);
        assert!(crop.height() <= 800);
        assert_eq!(crop.width(), 60); // 10 left pad + 40 + clamped right
    }
}
