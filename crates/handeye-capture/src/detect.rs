//! Calibration pattern visibility check and the live overlay.
//!
//! [`PatternDetector`] is the seam to the target detector. The bundled
//! [`ChessboardDetector`] runs the `calib-targets` chessboard pipeline
//! (ChESS corners, then grid graph) on the grayscale frame and reports the
//! pattern as visible only when the recovered grid has exactly the
//! configured `cols` × `rows` inner corners.

use std::collections::BTreeSet;

use calib_targets::chessboard::ChessboardParams;
use calib_targets::detect;
use chess_corners::ChessConfig;
use image::{Rgb, RgbImage};
use nalgebra::Point2;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Result of looking for the calibration pattern in one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatternDetection {
    pub found: bool,
    /// Refined feature locations in pixel coordinates, for drawing only.
    pub corners: Vec<Point2<f32>>,
}

impl PatternDetection {
    pub fn not_found() -> Self {
        Self::default()
    }
}

/// Stateless per-call pattern detector.
pub trait PatternDetector: Send {
    fn detect(&self, frame: &RgbImage) -> PatternDetection;
}

impl<F> PatternDetector for F
where
    F: Fn(&RgbImage) -> PatternDetection + Send,
{
    fn detect(&self, frame: &RgbImage) -> PatternDetection {
        self(frame)
    }
}

/// Chessboard with `cols` × `rows` inner corners.
pub struct ChessboardDetector {
    cols: u32,
    rows: u32,
    chess_cfg: ChessConfig,
    params: ChessboardParams,
}

impl ChessboardDetector {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self::with_chess_config(cols, rows, detect::default_chess_config())
    }

    pub fn with_chess_config(cols: u32, rows: u32, chess_cfg: ChessConfig) -> Self {
        let params = ChessboardParams {
            expected_rows: Some(rows),
            expected_cols: Some(cols),
            min_corners: cols as usize * rows as usize,
            completeness_threshold: 1.0,
            ..ChessboardParams::default()
        };
        Self {
            cols,
            rows,
            chess_cfg,
            params,
        }
    }

    pub fn expected_corners(&self) -> usize {
        self.cols as usize * self.rows as usize
    }
}

impl PatternDetector for ChessboardDetector {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, frame), fields(width = frame.width(), height = frame.height()))
    )]
    fn detect(&self, frame: &RgbImage) -> PatternDetection {
        if self.expected_corners() == 0 {
            return PatternDetection::not_found();
        }
        let gray = image::imageops::grayscale(frame);
        let Some(result) = detect::detect_chessboard(&gray, &self.chess_cfg, self.params.clone())
        else {
            return PatternDetection::not_found();
        };
        let labeled = &result.detection.corners;
        let found = labeled.len() == self.expected_corners()
            && is_complete_grid(
                labeled.iter().filter_map(|c| c.grid.as_ref().map(|g| (g.i, g.j))),
                self.cols,
                self.rows,
            );
        PatternDetection {
            found,
            corners: labeled.iter().map(|c| c.position).collect(),
        }
    }
}

/// True when `coords` are exactly the cells of a `cols` × `rows` grid, in
/// either orientation.
fn is_complete_grid(coords: impl IntoIterator<Item = (i32, i32)>, cols: u32, rows: u32) -> bool {
    let cells: BTreeSet<(i32, i32)> = coords.into_iter().collect();
    if cells.is_empty() || cells.len() != cols as usize * rows as usize {
        return false;
    }
    let (mut min_i, mut max_i) = (i32::MAX, i32::MIN);
    let (mut min_j, mut max_j) = (i32::MAX, i32::MIN);
    for &(i, j) in &cells {
        min_i = min_i.min(i);
        max_i = max_i.max(i);
        min_j = min_j.min(j);
        max_j = max_j.max(j);
    }
    let width = i64::from(max_i) - i64::from(min_i) + 1;
    let height = i64::from(max_j) - i64::from(min_j) + 1;
    let (cols, rows) = (i64::from(cols), i64::from(rows));
    (width, height) == (cols, rows) || (width, height) == (rows, cols)
}

const FOUND: Rgb<u8> = Rgb([0, 255, 0]);
const MISSING: Rgb<u8> = Rgb([255, 0, 0]);
const PARTIAL: Rgb<u8> = Rgb([255, 200, 0]);
const MARK_RADIUS: i64 = 4;
const BORDER: u32 = 4;

/// Copy of `frame` with the detection drawn on top: green corner marks when
/// the pattern is found, otherwise a red frame border and amber marks for the
/// corners that were seen.
pub fn render_overlay(frame: &RgbImage, detection: &PatternDetection) -> RgbImage {
    let mut out = frame.clone();
    let mark = if detection.found { FOUND } else { PARTIAL };
    for p in &detection.corners {
        draw_cross(&mut out, p, mark);
    }
    if !detection.found {
        draw_border(&mut out, MISSING);
    }
    out
}

const STATUS_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const STATUS_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_SCALE: u32 = 2;

/// Draw `text` in the top-left corner on a dark band, with a 3x5 pixel font
/// scaled by two. Letters are drawn in one case; unsupported characters
/// leave a gap.
pub fn draw_status_line(img: &mut RgbImage, text: &str) {
    if text.is_empty() {
        return;
    }
    let s = GLYPH_SCALE;
    let advance = 4 * s;
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    let band_w = chars
        .saturating_mul(advance)
        .saturating_add(s)
        .min(img.width());
    let band_h = (7 * s).min(img.height());
    for y in 0..band_h {
        for x in 0..band_w {
            img.put_pixel(x, y, STATUS_BACKGROUND);
        }
    }

    let s = i64::from(s);
    for (n, c) in text.chars().enumerate() {
        let x0 = s + n as i64 * i64::from(advance);
        for (row, bits) in glyph(c.to_ascii_lowercase()).iter().enumerate() {
            for col in 0..3_i64 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                let (px, py) = (x0 + col * s, s + row as i64 * s);
                for dy in 0..s {
                    for dx in 0..s {
                        put(img, px + dx, py + dy, STATUS_TEXT);
                    }
                }
            }
        }
    }
}

/// Rows of a 3x5 glyph, most significant of the three bits on the left.
fn glyph(c: char) -> [u8; 5] {
    match c {
        '0' => [7, 5, 5, 5, 7],
        '1' => [2, 6, 2, 2, 7],
        '2' => [7, 1, 7, 4, 7],
        '3' => [7, 1, 7, 1, 7],
        '4' => [5, 5, 7, 1, 1],
        '5' => [7, 4, 7, 1, 7],
        '6' => [7, 4, 7, 5, 7],
        '7' => [7, 1, 2, 2, 2],
        '8' => [7, 5, 7, 5, 7],
        '9' => [7, 5, 7, 1, 7],
        'a' => [2, 5, 7, 5, 5],
        'b' => [6, 5, 6, 5, 6],
        'c' => [3, 4, 4, 4, 3],
        'd' => [6, 5, 5, 5, 6],
        'e' => [7, 4, 6, 4, 7],
        'f' => [7, 4, 6, 4, 4],
        'g' => [3, 4, 5, 5, 3],
        'h' => [5, 5, 7, 5, 5],
        'i' => [7, 2, 2, 2, 7],
        'j' => [1, 1, 1, 5, 2],
        'k' => [5, 5, 6, 5, 5],
        'l' => [4, 4, 4, 4, 7],
        'm' => [5, 7, 7, 5, 5],
        'n' => [6, 5, 5, 5, 5],
        'o' => [2, 5, 5, 5, 2],
        'p' => [6, 5, 6, 4, 4],
        'q' => [2, 5, 5, 6, 3],
        'r' => [6, 5, 6, 5, 5],
        's' => [3, 4, 2, 1, 6],
        't' => [7, 2, 2, 2, 2],
        'u' => [5, 5, 5, 5, 7],
        'v' => [5, 5, 5, 5, 2],
        'w' => [5, 5, 7, 7, 5],
        'x' => [5, 5, 2, 5, 5],
        'y' => [5, 5, 2, 2, 2],
        'z' => [7, 1, 2, 4, 7],
        ':' => [0, 2, 0, 2, 0],
        '|' => [2, 2, 2, 2, 2],
        '.' => [0, 0, 0, 0, 2],
        '-' => [0, 0, 7, 0, 0],
        '_' => [0, 0, 0, 0, 7],
        '/' => [1, 1, 2, 4, 4],
        _ => [0; 5],
    }
}

fn draw_cross(img: &mut RgbImage, p: &Point2<f32>, color: Rgb<u8>) {
    if !p.x.is_finite() || !p.y.is_finite() {
        return;
    }
    let (cx, cy) = (p.x.round() as i64, p.y.round() as i64);
    for d in -MARK_RADIUS..=MARK_RADIUS {
        put(img, cx + d, cy, color);
        put(img, cx, cy + d, color);
    }
}

fn draw_border(img: &mut RgbImage, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    let t = BORDER.min(w / 2).min(h / 2);
    for y in 0..h {
        for x in 0..w {
            if x < t || y < t || x >= w - t || y >= h - t {
                img.put_pixel(x, y, color);
            }
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u64) < img.width() as u64 && (y as u64) < img.height() as u64 {
        img.put_pixel(x as u32, y as u32, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_marks_found_corners_in_green() {
        let frame = RgbImage::new(32, 24);
        let detection = PatternDetection {
            found: true,
            corners: vec![Point2::new(10.0, 10.0), Point2::new(-5.0, 40.0)],
        };
        let out = render_overlay(&frame, &detection);
        assert_eq!(out.get_pixel(10, 10), &FOUND);
        assert_eq!(out.get_pixel(14, 10), &FOUND);
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn overlay_outlines_frame_when_not_found() {
        let frame = RgbImage::new(32, 24);
        let out = render_overlay(&frame, &PatternDetection::not_found());
        assert_eq!(out.get_pixel(0, 0), &MISSING);
        assert_eq!(out.get_pixel(31, 23), &MISSING);
        assert_eq!(out.get_pixel(16, 12), &Rgb([0, 0, 0]));
    }

    /// Black/white board with `squares_x` × `squares_y` squares of `square`
    /// pixels on a white margin.
    fn board_image(squares_x: u32, squares_y: u32, square: u32, margin: u32) -> RgbImage {
        let w = squares_x * square + 2 * margin;
        let h = squares_y * square + 2 * margin;
        RgbImage::from_fn(w, h, |x, y| {
            if x < margin || y < margin || x >= w - margin || y >= h - margin {
                return Rgb([255, 255, 255]);
            }
            let (sx, sy) = ((x - margin) / square, (y - margin) / square);
            if (sx + sy) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    fn noise_image(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut state = seed;
        RgbImage::from_fn(width, height, |_, _| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let v = (state >> 56) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn complete_grid_matches_configured_size_in_either_orientation() {
        let grid = |w: i32, h: i32| -> Vec<(i32, i32)> {
            (0..h).flat_map(|j| (0..w).map(move |i| (i, j))).collect()
        };
        assert!(is_complete_grid(grid(9, 6), 9, 6));
        assert!(is_complete_grid(grid(6, 9), 9, 6));
        let shifted = grid(9, 6).into_iter().map(|(i, j)| (i - 4, j + 7));
        assert!(is_complete_grid(shifted, 9, 6));

        assert!(!is_complete_grid(grid(12, 9), 9, 6));
        assert!(!is_complete_grid(grid(9, 5), 9, 6));
        assert!(!is_complete_grid(Vec::<(i32, i32)>::new(), 0, 0));

        let mut holed = grid(9, 6);
        holed[10] = (20, 20);
        assert!(!is_complete_grid(holed, 9, 6));

        let mut doubled = grid(9, 6);
        doubled[10] = doubled[11];
        assert!(!is_complete_grid(doubled, 9, 6));
    }

    #[test]
    fn larger_board_is_not_the_configured_pattern() {
        // 13 x 10 squares has 12 x 9 inner corners.
        let frame = board_image(13, 10, 30, 40);
        let detection = ChessboardDetector::new(9, 6).detect(&frame);
        assert!(!detection.found);
    }

    #[test]
    fn noise_frame_has_no_chessboard() {
        let frame = noise_image(640, 480, 0x5eed);
        let detection = ChessboardDetector::new(9, 6).detect(&frame);
        assert!(!detection.found);
    }

    #[test]
    fn degenerate_board_size_is_never_found() {
        let frame = board_image(10, 7, 30, 40);
        assert!(!ChessboardDetector::new(0, 6).detect(&frame).found);
    }

    #[test]
    fn blank_frame_has_no_chessboard() {
        let detector = ChessboardDetector::new(9, 6);
        let frame = RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]));
        let detection = detector.detect(&frame);
        assert!(!detection.found);
    }

    #[test]
    fn status_line_is_drawn_on_a_dark_band() {
        let mut img = RgbImage::from_pixel(400, 40, Rgb([128, 128, 128]));
        draw_status_line(&mut img, "Captured: 3 | session: data2024050101");
        // 'c' has its top row at columns 1 and 2.
        assert_eq!(img.get_pixel(2, 2), &STATUS_BACKGROUND);
        assert_eq!(img.get_pixel(4, 2), &STATUS_TEXT);
        assert_eq!(img.get_pixel(7, 3), &STATUS_TEXT);
        assert_eq!(img.get_pixel(0, 0), &STATUS_BACKGROUND);
        assert_eq!(img.get_pixel(399, 39), &Rgb([128, 128, 128]));
        let lit = img.pixels().filter(|p| **p == STATUS_TEXT).count();
        assert!(lit > 100, "only {lit} text pixels");
    }

    #[test]
    fn status_line_is_clipped_to_small_frames() {
        let mut img = RgbImage::from_pixel(6, 3, Rgb([9, 9, 9]));
        draw_status_line(&mut img, "captured: 12");
        assert_eq!(img.get_pixel(0, 0), &STATUS_BACKGROUND);
        assert_eq!(img.get_pixel(5, 2), &STATUS_TEXT);

        let mut untouched = RgbImage::from_pixel(6, 3, Rgb([9, 9, 9]));
        draw_status_line(&mut untouched, "");
        assert!(untouched.pixels().all(|p| *p == Rgb([9, 9, 9])));
    }

    #[test]
    fn closures_are_detectors() {
        let always = |_: &RgbImage| PatternDetection {
            found: true,
            corners: Vec::new(),
        };
        assert!(always.detect(&RgbImage::new(1, 1)).found);
    }
}
