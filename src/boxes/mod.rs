//! Box localization: find the address field boxes on the last page of a
//! civil case cover sheet.
//!
//! The address page uses a multi-column boxed layout that defeats
//! full-page OCR, so we first locate each field's rectangle geometrically
//! and OCR the crops individually. Scanned pages are frequently skewed by
//! a fraction of a degree, which is enough to break border tracing, so
//! detection runs inside a bounded rotation search.

pub mod detect;

use std::{collections::BTreeMap, fmt};

use image::{GrayImage, Luma, imageops};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use serde::Serialize;

use crate::{
    config::{BoxSpec, ExtractConfig},
    prelude::*,
    render::PageImage,
};

use self::detect::BoxDetector;

/// An axis-aligned rectangle in page pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoxRect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// The four address sub-fields we localize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldLabel {
    Street,
    City,
    State,
    Zip,
}

impl FieldLabel {
    /// All labels, in localization order.
    pub const ALL: [FieldLabel; 4] =
        [FieldLabel::Street, FieldLabel::City, FieldLabel::State, FieldLabel::Zip];

    /// The ledger column name for this field.
    pub fn column(self) -> &'static str {
        match self {
            FieldLabel::Street => "street",
            FieldLabel::City => "city",
            FieldLabel::State => "state",
            FieldLabel::Zip => "zip",
        }
    }
}

impl fmt::Display for FieldLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A localized field box.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct FieldBox {
    /// Which field this box holds.
    pub label: FieldLabel,

    /// The bounding rectangle, in full-page coordinates.
    pub rect: BoxRect,

    /// The rotation at which detection succeeded.
    pub rotation_degrees: f32,

    /// Size deviation from the expected range center; lower is better.
    pub score: u32,
}

/// Localizes field boxes on a rendered cover-sheet page.
pub struct BoxLocalizer<'a> {
    config: &'a ExtractConfig,
    detector: &'a dyn BoxDetector,
}

impl<'a> BoxLocalizer<'a> {
    /// Create a localizer using the given detection collaborator.
    pub fn new(config: &'a ExtractConfig, detector: &'a dyn BoxDetector) -> Self {
        Self { config, detector }
    }

    /// Locate all four field boxes on a page.
    ///
    /// Street and city are searched independently. State and zip share
    /// one size range on the form, so they are detected as a pair and
    /// told apart by position. A label whose box cannot be found yields
    /// its own [`ExtractError::PatternNotFound`] without aborting
    /// localization of the others.
    #[instrument(level = "debug", skip_all, fields(page = page.page_number))]
    pub fn localize(
        &self,
        page: &PageImage,
    ) -> BTreeMap<FieldLabel, Result<FieldBox, ExtractError>> {
        let gray = page.image.to_luma8();
        let (page_width, page_height) = gray.dimensions();

        // The address block sits in the upper half of the page. Crop away
        // the rest, plus a top margin containing a similarly-sized box
        // that otherwise gets mistaken for the street address.
        let boxes_config = &self.config.boxes;
        let band_bottom =
            ((page_height as f32 * boxes_config.keep_fraction) as u32).min(page_height);
        let band_top = boxes_config.top_margin.min(band_bottom);
        let band = imageops::crop_imm(
            &gray,
            0,
            band_top,
            page_width,
            band_bottom - band_top,
        )
        .to_image();

        let mut found = BTreeMap::new();
        for label in [FieldLabel::Street, FieldLabel::City] {
            // The street box shares its row with the REASON box in the
            // left column; crop that column away for the street search.
            let left_offset = match label {
                FieldLabel::Street => boxes_config.street_left_crop.min(band.width() - 1),
                _ => 0,
            };
            let region = if left_offset > 0 {
                imageops::crop_imm(
                    &band,
                    left_offset,
                    0,
                    band.width() - left_offset,
                    band.height(),
                )
                .to_image()
            } else {
                band.clone()
            };

            let spec = self.spec_for(label);
            let result = match self.search_rotations(&region, spec) {
                Some((rect, rotation_degrees, score)) => {
                    let rect = clamp_to_page(
                        BoxRect {
                            x: rect.x + left_offset,
                            y: rect.y + band_top,
                            width: rect.width,
                            height: rect.height,
                        },
                        page_width,
                        page_height,
                    );
                    Ok(FieldBox {
                        label,
                        rect,
                        rotation_degrees,
                        score,
                    })
                }
                None => {
                    let max_degrees = self.max_rotation_degrees();
                    Err(ExtractError::box_not_found(label.column(), max_degrees))
                }
            };
            found.insert(label, result);
        }

        let (state, zip) =
            self.localize_state_zip(&band, band_top, page_width, page_height);
        found.insert(FieldLabel::State, state);
        found.insert(FieldLabel::Zip, zip);
        found
    }

    /// Locate the state and zip boxes.
    ///
    /// Their size ranges are indistinguishable, so size-based selection
    /// alone would hand both labels the same rectangle. Instead, detect
    /// up to two pair-sized candidates and assign by position: the left
    /// box is the state, the right box is the zip. A lone candidate goes
    /// to the state slot, and the zip reports not found.
    fn localize_state_zip(
        &self,
        band: &GrayImage,
        band_top: u32,
        page_width: u32,
        page_height: u32,
    ) -> (
        Result<FieldBox, ExtractError>,
        Result<FieldBox, ExtractError>,
    ) {
        let state_spec = &self.config.boxes.state;
        let zip_spec = &self.config.boxes.zip;
        let max_degrees = self.max_rotation_degrees();

        let Some((pair, degrees)) = self.search_rotations_pair(band, state_spec, zip_spec)
        else {
            return (
                Err(ExtractError::box_not_found("state", max_degrees)),
                Err(ExtractError::box_not_found("zip", max_degrees)),
            );
        };

        let assign = |label: FieldLabel, spec: &BoxSpec, candidate: Option<&BoxRect>| {
            match candidate {
                Some(rect) if spec.matches(rect.width, rect.height) => {
                    let rect = clamp_to_page(
                        BoxRect {
                            x: rect.x,
                            y: rect.y + band_top,
                            width: rect.width,
                            height: rect.height,
                        },
                        page_width,
                        page_height,
                    );
                    Ok(FieldBox {
                        label,
                        rect,
                        rotation_degrees: degrees,
                        score: spec.deviation(rect.width, rect.height),
                    })
                }
                _ => Err(ExtractError::box_not_found(label.column(), max_degrees)),
            }
        };
        // `pair` is ordered left to right.
        let state = assign(FieldLabel::State, state_spec, pair.first());
        let zip = assign(FieldLabel::Zip, zip_spec, pair.get(1));
        (state, zip)
    }

    /// Rotation search for the state/zip pair. Same attempt sequence as
    /// the single-box search; stops at the first angle that produces any
    /// pair-sized candidate.
    fn search_rotations_pair(
        &self,
        region: &GrayImage,
        state_spec: &BoxSpec,
        zip_spec: &BoxSpec,
    ) -> Option<(Vec<BoxRect>, f32)> {
        let rotation = &self.config.rotation;
        for attempt in 0..rotation.max_attempts {
            let degrees = attempt_degrees(attempt, rotation.step_degrees);
            let candidates = if degrees == 0.0 {
                self.detect_pair(region, state_spec, zip_spec)
            } else {
                let rotated = rotate_about_center(
                    region,
                    degrees.to_radians(),
                    Interpolation::Bilinear,
                    Luma([255u8]),
                );
                self.detect_pair(&rotated, state_spec, zip_spec)
            };
            if !candidates.is_empty() {
                if degrees != 0.0 {
                    debug!(degrees, "state/zip pair detected after rotation");
                }
                return Some((candidates, degrees));
            }
        }
        None
    }

    /// Detect with both specs, keep the best two candidates, and order
    /// them left to right for positional assignment.
    fn detect_pair(
        &self,
        image: &GrayImage,
        state_spec: &BoxSpec,
        zip_spec: &BoxSpec,
    ) -> Vec<BoxRect> {
        let mut candidates = self.detector.detect(image, state_spec);
        candidates.extend(self.detector.detect(image, zip_spec));
        candidates.sort_by_key(|r| (r.y, r.x, r.width, r.height));
        candidates.dedup();

        let mut scored: Vec<(BoxRect, u32)> = candidates
            .into_iter()
            .filter(|r| {
                state_spec.matches(r.width, r.height) || zip_spec.matches(r.width, r.height)
            })
            .map(|r| {
                let score = state_spec
                    .deviation(r.width, r.height)
                    .min(zip_spec.deviation(r.width, r.height));
                (r, score)
            })
            .collect();
        scored.sort_by_key(|(r, score)| (*score, r.y, r.x));
        scored.truncate(2);

        let mut pair: Vec<BoxRect> = scored.into_iter().map(|(r, _)| r).collect();
        pair.sort_by_key(|r| r.x);
        pair
    }

    /// The expected size range for a label.
    fn spec_for(&self, label: FieldLabel) -> &BoxSpec {
        match label {
            FieldLabel::Street => &self.config.boxes.street,
            FieldLabel::City => &self.config.boxes.city,
            FieldLabel::State => &self.config.boxes.state,
            FieldLabel::Zip => &self.config.boxes.zip,
        }
    }

    /// The outer edge of the rotation search, for error messages.
    fn max_rotation_degrees(&self) -> f32 {
        let rotation = &self.config.rotation;
        (rotation.max_attempts / 2) as f32 * rotation.step_degrees
    }

    /// Run detection at alternating rotations until candidates appear.
    ///
    /// The attempt sequence is 0, +s, -s, +2s, -2s, … with a hard cap on
    /// the attempt count, so per-document latency is bounded. Returns the
    /// best in-tolerance candidate at the first angle that produces any.
    fn search_rotations(
        &self,
        region: &GrayImage,
        spec: &BoxSpec,
    ) -> Option<(BoxRect, f32, u32)> {
        let rotation = &self.config.rotation;
        for attempt in 0..rotation.max_attempts {
            let degrees = attempt_degrees(attempt, rotation.step_degrees);
            let candidates = if degrees == 0.0 {
                self.detector.detect(region, spec)
            } else {
                let rotated = rotate_about_center(
                    region,
                    degrees.to_radians(),
                    Interpolation::Bilinear,
                    Luma([255u8]),
                );
                self.detector.detect(&rotated, spec)
            };
            if let Some((rect, score)) = select_candidate(&candidates, spec) {
                if degrees != 0.0 {
                    debug!(degrees, "box detected after rotation");
                }
                return Some((rect, degrees, score));
            }
        }
        None
    }
}

/// The rotation angle for the nth attempt: 0, +s, -s, +2s, -2s, …
fn attempt_degrees(attempt: u32, step: f32) -> f32 {
    if attempt == 0 {
        return 0.0;
    }
    let magnitude = attempt.div_ceil(2) as f32 * step;
    if attempt % 2 == 1 { magnitude } else { -magnitude }
}

/// Pick the best candidate: lowest size deviation from the expected range,
/// with exact ties broken top-most then left-most. The ordering is fixed
/// here rather than inherited from the detector's iteration order.
fn select_candidate(candidates: &[BoxRect], spec: &BoxSpec) -> Option<(BoxRect, u32)> {
    candidates
        .iter()
        .filter(|rect| spec.matches(rect.width, rect.height))
        .map(|rect| (*rect, spec.deviation(rect.width, rect.height)))
        .min_by_key(|(rect, score)| (*score, rect.y, rect.x))
}

/// Shrink a rectangle so it lies within the page bounds.
fn clamp_to_page(mut rect: BoxRect, page_width: u32, page_height: u32) -> BoxRect {
    rect.x = rect.x.min(page_width.saturating_sub(1));
    rect.y = rect.y.min(page_height.saturating_sub(1));
    rect.width = rect.width.min(page_width - rect.x);
    rect.height = rect.height.min(page_height - rect.y);
    rect
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use image::DynamicImage;

    use super::*;

    fn rect(x: u32, y: u32, width: u32, height: u32) -> BoxRect {
        BoxRect {
            x,
            y,
            width,
            height,
        }
    }

    fn spec() -> BoxSpec {
        BoxSpec {
            width: (250, 850),
            height: (90, 210),
            aspect: (0.5, 12.0),
        }
    }

    /// A detector that replays canned candidates and counts calls.
    struct StubDetector {
        per_label: Vec<(BoxSpec, Vec<BoxRect>)>,
        calls: AtomicU32,
    }

    impl StubDetector {
        fn new(per_label: Vec<(BoxSpec, Vec<BoxRect>)>) -> Self {
            Self {
                per_label,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl BoxDetector for StubDetector {
        fn detect(&self, _image: &GrayImage, spec: &BoxSpec) -> Vec<BoxRect> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.per_label
                .iter()
                .find(|(s, _)| s.width == spec.width && s.height == spec.height)
                .map(|(_, rects)| rects.clone())
                .unwrap_or_default()
        }
    }

    fn test_page() -> PageImage {
        PageImage {
            page_number: 6,
            image: DynamicImage::new_luma8(2550, 3300),
            dpi: 300,
        }
    }

    #[test]
    fn tie_break_is_top_most_then_left_most() {
        let candidates = [
            rect(900, 500, 500, 150),
            rect(100, 200, 500, 150),
            rect(700, 200, 500, 150),
        ];
        let (best, _) = select_candidate(&candidates, &spec()).unwrap();
        assert_eq!(best, rect(100, 200, 500, 150));

        // Order of the input must not matter.
        let reversed: Vec<_> = candidates.iter().rev().copied().collect();
        let (best, _) = select_candidate(&reversed, &spec()).unwrap();
        assert_eq!(best, rect(100, 200, 500, 150));
    }

    #[test]
    fn lower_deviation_beats_position() {
        // Center of the expected range is 550x150; the second candidate
        // is lower on the page but a much better size match.
        let candidates = [rect(100, 100, 260, 95), rect(100, 900, 550, 150)];
        let (best, score) = select_candidate(&candidates, &spec()).unwrap();
        assert_eq!(best, rect(100, 900, 550, 150));
        assert_eq!(score, 0);
    }

    #[test]
    fn missing_field_does_not_abort_the_others() {
        let config = ExtractConfig::default();
        // Candidates for city and the state/zip pair, nothing
        // street-sized.
        let detector = StubDetector::new(vec![
            (config.boxes.city.clone(), vec![rect(200, 300, 500, 150)]),
            (
                config.boxes.state.clone(),
                vec![rect(800, 300, 250, 150), rect(1100, 300, 250, 150)],
            ),
            (config.boxes.street.clone(), vec![]),
        ]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());

        assert!(matches!(
            found[&FieldLabel::Street],
            Err(ExtractError::PatternNotFound(_))
        ));
        assert!(found[&FieldLabel::City].is_ok());
        assert!(found[&FieldLabel::State].is_ok());
        assert!(found[&FieldLabel::Zip].is_ok());
    }

    #[test]
    fn rotation_search_is_bounded() {
        let mut config = ExtractConfig::default();
        config.rotation.max_attempts = 5;
        // Nothing ever matches, for any label.
        let detector = StubDetector::new(vec![]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());
        assert!(found.values().all(|result| result.is_err()));
        // max_attempts calls each for street and city, and two calls per
        // attempt for the state/zip pair.
        assert_eq!(detector.calls.load(Ordering::Relaxed), 5 * 4);
    }

    #[test]
    fn state_and_zip_split_left_and_right() {
        let config = ExtractConfig::default();
        // Two boxes of the same pair size; size deviation cannot tell
        // them apart, so assignment must go by position regardless of
        // detector order.
        let detector = StubDetector::new(vec![(
            config.boxes.state.clone(),
            vec![rect(1100, 300, 250, 150), rect(800, 300, 250, 150)],
        )]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());

        let state = found[&FieldLabel::State].as_ref().unwrap();
        let zip = found[&FieldLabel::Zip].as_ref().unwrap();
        assert_ne!(state.rect, zip.rect);
        assert_eq!(state.rect.x, 800);
        assert_eq!(zip.rect.x, 1100);
    }

    #[test]
    fn state_zip_pair_prefers_best_sized_candidates() {
        let config = ExtractConfig::default();
        // A poorly-sized candidate left of the real pair must not steal
        // the state slot.
        let detector = StubDetector::new(vec![(
            config.boxes.state.clone(),
            vec![
                rect(500, 300, 440, 200),
                rect(800, 300, 250, 150),
                rect(1100, 300, 250, 150),
            ],
        )]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());

        let state = found[&FieldLabel::State].as_ref().unwrap();
        let zip = found[&FieldLabel::Zip].as_ref().unwrap();
        assert_eq!(state.rect.x, 800);
        assert_eq!(zip.rect.x, 1100);
    }

    #[test]
    fn lone_pair_candidate_goes_to_state() {
        let config = ExtractConfig::default();
        let detector = StubDetector::new(vec![(
            config.boxes.state.clone(),
            vec![rect(800, 300, 250, 150)],
        )]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());

        let state = found[&FieldLabel::State].as_ref().unwrap();
        assert_eq!(state.rect.x, 800);
        assert!(matches!(
            found[&FieldLabel::Zip],
            Err(ExtractError::PatternNotFound(_))
        ));
    }

    #[test]
    fn attempt_sequence_alternates() {
        let step = 0.1;
        let degrees: Vec<f32> =
            (0..5).map(|attempt| attempt_degrees(attempt, step)).collect();
        assert_eq!(degrees, vec![0.0, 0.1, -0.1, 0.2, -0.2]);
    }

    #[test]
    fn boxes_are_translated_into_page_coordinates() {
        let config = ExtractConfig::default();
        // The stub reports city at y=0 of the cropped band; the page
        // coordinates must include the top margin.
        let detector = StubDetector::new(vec![(
            config.boxes.city.clone(),
            vec![rect(200, 0, 500, 150)],
        )]);
        let localizer = BoxLocalizer::new(&config, &detector);
        let found = localizer.localize(&test_page());
        let city = found[&FieldLabel::City].as_ref().unwrap();
        assert_eq!(city.rect.y, config.boxes.top_margin);
        assert_eq!(city.rect.x, 200);
        // Street candidates come back in band coordinates too, and the
        // left crop offset must be added back.
        assert!(city.rect.x + city.rect.width <= 2550);
    }

    #[test]
    fn clamping_keeps_rects_inside_the_page() {
        let clamped = clamp_to_page(rect(2500, 3200, 200, 300), 2550, 3300);
        assert!(clamped.x + clamped.width <= 2550);
        assert!(clamped.y + clamped.height <= 3300);
    }
}
