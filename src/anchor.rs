// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Drift-tracking anchor regions and the heuristic that picks one.

use crate::DriftError;
use crate::config::DriftConfig;
use crate::hardware::{ScanPair, ScanSettings, acquire_frame};
use crate::utils::{self, MatExt};
use log::{debug, info};
use opencv::core::{Mat, MatTraitConst};
use opencv::imgproc;
use std::time::Duration;

/// A rectangle in fractions of the full field: `0 <= left < right <= 1`,
/// `0 <= top < bottom <= 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
}

impl Roi {
    /// ```
    /// # use libdrift::anchor::Roi;
    /// assert!(Roi::new(0.1, 0.2, 0.3, 0.4).is_ok());
    /// assert!(Roi::new(0.3, 0.2, 0.1, 0.4).is_err());
    /// assert!(Roi::new(0.1, 0.2, 1.3, 0.4).is_err());
    /// ```
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Result<Self, DriftError> {
        let ok = (0.0..=1.0).contains(&left)
            && (0.0..=1.0).contains(&top)
            && (0.0..=1.0).contains(&right)
            && (0.0..=1.0).contains(&bottom)
            && left < right
            && top < bottom;
        if !ok {
            return Err(DriftError::InvalidParams(format!(
                "invalid roi ({left}, {top}, {right}, {bottom})"
            )));
        }
        Ok(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn full() -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: 1.0,
            bottom: 1.0,
        }
    }

    /// `(left, top, right, bottom)`
    pub fn ltrb(&self) -> (f64, f64, f64, f64) {
        (self.left, self.top, self.right, self.bottom)
    }

    pub fn overlaps(&self, other: &Roi) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }
}

/// Where and how the anchor is scanned during a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRegion {
    pub roi: Roi,
    pub dwell_time: Duration,
    /// Scan scale, in full-field pixels per anchor pixel.
    pub scale: f64,
}

impl AnchorRegion {
    pub fn new(roi: Roi, dwell_time: Duration) -> Self {
        Self {
            roi,
            dwell_time,
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

/// Parameters of [`select_anchor()`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSearch {
    /// Side of the square anchor, in full-frame pixels.
    pub anchor_size_px: usize,
    /// Low hysteresis threshold of the Canny edge detector.
    pub canny_low: f64,
    /// High hysteresis threshold of the Canny edge detector.
    pub canny_high: f64,
}

impl Default for AnchorSearch {
    fn default() -> Self {
        Self {
            anchor_size_px: 50,
            canny_low: 100.0,
            canny_high: 200.0,
        }
    }
}

/// Picks an anchor with the default [`AnchorSearch`] parameters.
pub fn select_anchor(full_frame: &Mat, forbidden: &Roi) -> Result<Option<Roi>, DriftError> {
    select_anchor_with(full_frame, forbidden, &AnchorSearch::default())
}

/// Picks a square anchor region with edge content, away from `forbidden`.
///
/// The frame is min-max scaled to 8 bit and run through a Canny detector.
/// Edge pixels closer than half an anchor to `forbidden` or to the frame
/// border are ignored, the first remaining one in row-major order becomes
/// the anchor centre. This is "a" valid anchor, not the best scored one.
///
/// Returns `Ok(None)` when no edge pixel qualifies.
pub fn select_anchor_with(
    full_frame: &Mat,
    forbidden: &Roi,
    search: &AnchorSearch,
) -> Result<Option<Roi>, DriftError> {
    if full_frame.empty() {
        return Err(DriftError::InvalidInput("empty full frame".to_string()));
    }
    if search.anchor_size_px < 2 {
        return Err(DriftError::InvalidParams(format!(
            "anchor size {} too small",
            search.anchor_size_px
        )));
    }
    let (rows, cols) = full_frame.shape();
    let half = search.anchor_size_px / 2;
    if rows < 2 * half + 1 || cols < 2 * half + 1 {
        debug!("frame {rows}x{cols} smaller than an anchor");
        return Ok(None);
    }

    let grey = utils::to_grey_f64(full_frame)?;
    let grey_u8 = utils::to_u8_scaled(&grey)?;
    let mut edges = Mat::default();
    imgproc::canny(
        &grey_u8,
        &mut edges,
        search.canny_low,
        search.canny_high,
        3,
        false,
    )?;
    let edges = if edges.is_continuous() {
        edges
    } else {
        edges.try_clone()?
    };
    let data = edges.data_typed::<u8>()?;

    let (fl, ft, fr, fb) = forbidden.ltrb();
    let half_f = half as f64;
    let masked_x = (fl * cols as f64 - half_f, fr * cols as f64 + half_f);
    let masked_y = (ft * rows as f64 - half_f, fb * rows as f64 + half_f);
    let in_forbidden = |x: usize, y: usize| {
        let (x, y) = (x as f64, y as f64);
        x >= masked_x.0 && x < masked_x.1 && y >= masked_y.0 && y < masked_y.1
    };

    for y in half..rows - half {
        for x in half..cols - half {
            if data[y * cols + x] != 0 && !in_forbidden(x, y) {
                let roi = Roi::new(
                    (x - half) as f64 / cols as f64,
                    (y - half) as f64 / rows as f64,
                    (x + half) as f64 / cols as f64,
                    (y + half) as f64 / rows as f64,
                )?;
                debug!("anchor centred on pixel ({x}, {y})");
                return Ok(Some(roi));
            }
        }
    }
    Ok(None)
}

/// Scans the full field with `scanner` and runs [`select_anchor_with()`] on it.
///
/// Capture failures are reported as [`DriftError::AnchorCapture`].
pub fn guess_anchor_region(
    scanner: &ScanPair,
    forbidden: &Roi,
    dwell_time: Duration,
    config: &DriftConfig,
) -> Result<Option<Roi>, DriftError> {
    let scan = ScanSettings::full_field(scanner.emitter.as_ref(), dwell_time);
    let task = acquire_frame(
        scanner,
        scan,
        config.timeout_factor,
        config.timeout_margin(),
    )?;
    let frame = task.result(None).map_err(|e| match e {
        DriftError::Cancelled => DriftError::Cancelled,
        e => DriftError::AnchorCapture(e.to_string()),
    })?;
    let roi = select_anchor_with(frame.data(), forbidden, &config.anchor_search())?;
    match &roi {
        Some(r) => info!("anchor region guessed at {:?}", r.ltrb()),
        None => info!("no anchor region found outside {:?}", forbidden.ltrb()),
    }
    Ok(roi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::mat_from_fn;

    /// 200x200 black frame with a bright square covering `[lo, hi)` in both axes.
    fn square_frame(lo: usize, hi: usize) -> Mat {
        mat_from_fn(200, 200, |r, c| {
            if (lo..hi).contains(&r) && (lo..hi).contains(&c) {
                1000.0
            } else {
                0.0
            }
        })
        .unwrap()
    }

    #[test]
    fn roi_overlap() {
        let a = Roi::new(0.0, 0.0, 0.5, 0.5).unwrap();
        let b = Roi::new(0.4, 0.4, 0.6, 0.6).unwrap();
        let c = Roi::new(0.5, 0.0, 1.0, 0.5).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(Roi::full().overlaps(&c));
    }

    #[test]
    fn edges_only_in_forbidden_region() {
        let frame = square_frame(80, 120);
        let forbidden = Roi::new(0.3, 0.3, 0.7, 0.7).unwrap();
        assert_eq!(None, select_anchor(&frame, &forbidden).unwrap());
    }

    #[test]
    fn finds_edges_outside_forbidden_region() {
        let frame = square_frame(80, 120);
        let forbidden = Roi::new(0.0, 0.0, 0.1, 0.1).unwrap();
        let anchor = select_anchor(&frame, &forbidden).unwrap().unwrap();
        let (l, t, r, b) = anchor.ltrb();
        assert!((r - l - 0.25).abs() < 1e-9);
        assert!((b - t - 0.25).abs() < 1e-9);
        assert!(!anchor.overlaps(&forbidden));
        // first edge in scan order is on the top side of the square
        let centre_row = (t + b) / 2.0 * 200.0;
        assert!((78.0..=82.0).contains(&centre_row), "{centre_row}");
    }

    #[test]
    fn anchor_never_touches_forbidden_region() {
        // square straddling the forbidden border: its edges next to the
        // forbidden area are within half an anchor and must be skipped
        let frame = square_frame(60, 140);
        let forbidden = Roi::new(0.0, 0.0, 0.5, 1.0).unwrap();
        let anchor = select_anchor(&frame, &forbidden).unwrap().unwrap();
        assert!(!anchor.overlaps(&forbidden));
        let (l, t, r, b) = anchor.ltrb();
        assert!(l >= 0.5 && r <= 1.0 && t >= 0.0 && b <= 1.0);
    }

    #[test]
    fn blank_frame_has_no_anchor() {
        let frame = mat_from_fn(200, 200, |_, _| 7.0).unwrap();
        assert_eq!(None, select_anchor(&frame, &Roi::new(0.4, 0.4, 0.6, 0.6).unwrap()).unwrap());
    }

    #[test]
    fn frame_smaller_than_anchor() {
        let frame = mat_from_fn(30, 30, |r, _| r as f64).unwrap();
        assert_eq!(None, select_anchor(&frame, &Roi::new(0.0, 0.0, 0.1, 0.1).unwrap()).unwrap());
    }

    #[test]
    fn custom_anchor_size() {
        let frame = square_frame(80, 120);
        let search = AnchorSearch {
            anchor_size_px: 20,
            ..Default::default()
        };
        let anchor = select_anchor_with(&frame, &Roi::new(0.0, 0.0, 0.1, 0.1).unwrap(), &search)
            .unwrap()
            .unwrap();
        let (l, _, r, _) = anchor.ltrb();
        assert!((r - l - 0.1).abs() < 1e-9);
    }
}
