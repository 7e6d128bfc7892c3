//! The box-detection collaborator.
//!
//! The localizer only relies on the call contract here: given a grayscale
//! image and an expected size range, return candidate rectangles. The
//! default implementation is a contour-based detector; swap in something
//! smarter behind [`BoxDetector`] without touching the rotation search or
//! candidate selection.

use image::GrayImage;
use imageproc::{
    contours::{BorderType, find_contours},
    contrast::{ThresholdType, threshold},
};

use crate::config::BoxSpec;

use super::BoxRect;

/// Detects rectangular field regions in a page image.
pub trait BoxDetector: Send + Sync {
    /// Return candidate rectangles roughly matching `spec`.
    fn detect(&self, image: &GrayImage, spec: &BoxSpec) -> Vec<BoxRect>;
}

/// Contour-based rectangle detector.
///
/// Binarizes the image, traces connected borders, and keeps the bounding
/// rectangles of outer contours that fall within the expected size range.
/// Best-effort: it is very sensitive to skew, which is exactly why the
/// localizer wraps it in a rotation search.
#[derive(Clone, Debug)]
pub struct ContourBoxDetector {
    /// Binarization threshold; pixels at or below this are foreground.
    pub threshold: u8,
}

impl Default for ContourBoxDetector {
    fn default() -> Self {
        Self { threshold: 128 }
    }
}

impl BoxDetector for ContourBoxDetector {
    fn detect(&self, image: &GrayImage, spec: &BoxSpec) -> Vec<BoxRect> {
        // Dark ink on a light scan: invert so strokes become foreground.
        let binary = threshold(image, self.threshold, ThresholdType::BinaryInverted);
        let contours = find_contours::<i32>(&binary);

        let mut rects = vec![];
        for contour in contours {
            if contour.border_type != BorderType::Outer || contour.points.is_empty() {
                continue;
            }
            let mut min_x = i32::MAX;
            let mut min_y = i32::MAX;
            let mut max_x = i32::MIN;
            let mut max_y = i32::MIN;
            for point in &contour.points {
                min_x = min_x.min(point.x);
                min_y = min_y.min(point.y);
                max_x = max_x.max(point.x);
                max_y = max_y.max(point.y);
            }
            let width = (max_x - min_x + 1) as u32;
            let height = (max_y - min_y + 1) as u32;
            if spec.matches(width, height) {
                rects.push(BoxRect {
                    x: min_x.max(0) as u32,
                    y: min_y.max(0) as u32,
                    width,
                    height,
                });
            }
        }

        // Nested borders of a thick stroke can yield near-duplicates.
        rects.sort_by_key(|r| (r.y, r.x, r.width, r.height));
        rects.dedup();
        rects
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

    use super::*;

    fn page_with_box(x: i32, y: i32, width: u32, height: u32) -> GrayImage {
        let mut image = GrayImage::from_pixel(1200, 600, Luma([255u8]));
        draw_hollow_rect_mut(
            &mut image,
            Rect::at(x, y).of_size(width, height),
            Luma([0u8]),
        );
        image
    }

    fn spec() -> BoxSpec {
        BoxSpec {
            width: (300, 500),
            height: (100, 200),
            aspect: (0.5, 12.0),
        }
    }

    #[test]
    fn detects_a_drawn_rectangle() {
        let image = page_with_box(100, 50, 400, 150);
        let rects = ContourBoxDetector::default().detect(&image, &spec());
        assert_eq!(rects.len(), 1);
        let rect = rects[0];
        assert!(rect.x.abs_diff(100) <= 2);
        assert!(rect.y.abs_diff(50) <= 2);
        assert!(rect.width.abs_diff(400) <= 2);
        assert!(rect.height.abs_diff(150) <= 2);
    }

    #[test]
    fn ignores_out_of_range_rectangles() {
        // Checkbox-sized, far below the expected width range.
        let image = page_with_box(100, 50, 40, 40);
        let rects = ContourBoxDetector::default().detect(&image, &spec());
        assert!(rects.is_empty());
    }

    #[test]
    fn blank_page_has_no_candidates() {
        let image = GrayImage::from_pixel(1200, 600, Luma([255u8]));
        let rects = ContourBoxDetector::default().detect(&image, &spec());
        assert!(rects.is_empty());
    }
}
