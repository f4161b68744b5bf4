// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Translation estimation by phase correlation, with upsampled-DFT refinement
//! for sub-pixel precision.

use crate::DriftError;
use crate::utils::{self, MatExt};
use log::warn;
use opencv::core::{self, Mat, MatTrait, MatTraitConst, Vec2d};
use std::f64::consts::PI;
use std::ops::{Add, Neg, Sub};

/// A displacement in pixels of the reference image grid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShiftVector {
    pub row: f64,
    pub col: f64,
}

impl ShiftVector {
    pub fn new(row: f64, col: f64) -> Self {
        Self { row, col }
    }
}

/// A displacement in meters. `x` follows the columns, `y` points up (against the rows).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhysicalShift {
    pub x: f64,
    pub y: f64,
}

impl PhysicalShift {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Converts a pixel shift using the `(x, y)` pixel size of the image it was measured on.
    /// ```
    /// # use libdrift::shift::{PhysicalShift, ShiftVector};
    /// let p = PhysicalShift::from_pixels(ShiftVector::new(2.0, 3.0), (1e-6, 1e-6));
    /// assert_eq!((3e-6, -2e-6), (p.x, p.y));
    /// ```
    pub fn from_pixels(shift: ShiftVector, pixel_size: (f64, f64)) -> Self {
        Self {
            x: shift.col * pixel_size.0,
            y: -shift.row * pixel_size.1,
        }
    }

    /// Inverse of [`PhysicalShift::from_pixels()`].
    pub fn to_pixels(self, pixel_size: (f64, f64)) -> ShiftVector {
        ShiftVector {
            row: -self.y / pixel_size.1,
            col: self.x / pixel_size.0,
        }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl Add for PhysicalShift {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for PhysicalShift {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for PhysicalShift {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

/// Estimates how far `current` is displaced relative to `reference`.
///
/// If `current` is `reference` circularly shifted by `(dr, dc)` pixels, the
/// result is `(dr, dc)`. With `precision == 1` the answer is an integer pixel
/// shift. With `precision > 1` a half pixel estimate is first obtained from a
/// 2x Fourier zoom of the cross-power spectrum, then refined to `1/precision`
/// pixels by a matrix-multiply DFT evaluated only in a
/// `ceil(1.5 * precision)` wide neighbourhood of that estimate.
///
/// # Parameters
/// - `reference`, `current`: single channel 2d images of identical size, any depth
/// - `precision`: inverse of the wanted resolution, values below 1 are clamped to 1
///
/// # Returns
/// - `Ok(ShiftVector)` in pixels of the reference grid
/// - `Err(DriftError::InvalidInput)` if the images are empty, not single
///   channel 2d, or differ in size
pub fn estimate_shift(
    reference: &Mat,
    current: &Mat,
    precision: i32,
) -> Result<ShiftVector, DriftError> {
    check_input(reference, "reference")?;
    check_input(current, "current")?;
    if reference.size()? != current.size()? {
        return Err(DriftError::InvalidInput(format!(
            "shape mismatch: reference {:?} vs current {:?}",
            reference.shape(),
            current.shape()
        )));
    }
    let precision = if precision < 1 {
        warn!("precision {precision} < 1, using 1");
        1
    } else {
        precision
    };

    let (rows, cols) = reference.shape();
    let f_ref = spectrum(reference)?;
    let f_cur = spectrum(current)?;
    let mut product = Mat::default();
    core::mul_spectrums(&f_cur, &f_ref, &mut product, 0, true)?;

    let mut shift = if precision == 1 {
        let mut cc = Mat::default();
        core::idft(&product, &mut cc, 0, 0)?;
        let peak = find_peak(&cc)?;
        if peak.is_flat() {
            ShiftVector::default()
        } else {
            ShiftVector::new(
                wrap_index(peak.row, rows) as f64,
                wrap_index(peak.col, cols) as f64,
            )
        }
    } else {
        let coarse = coarse_shift(&product, rows, cols)?;
        refine_shift(&product, coarse, precision as f64)?
    };

    // a one pixel wide axis carries no shift information
    if rows == 1 {
        shift.row = 0.0;
    }
    if cols == 1 {
        shift.col = 0.0;
    }
    Ok(shift)
}

fn check_input(m: &Mat, what: &str) -> Result<(), DriftError> {
    if m.empty() || m.dims() != 2 || m.channels() != 1 {
        return Err(DriftError::InvalidInput(format!(
            "{what} must be a non-empty single channel 2d image (dims:{}, channels:{})",
            m.dims(),
            m.channels()
        )));
    }
    Ok(())
}

/// Full complex spectrum (`CV_64FC2`) of a real image.
fn spectrum(m: &Mat) -> Result<Mat, DriftError> {
    let real = m.convert(core::CV_64FC1, 1.0, 0.0)?;
    let mut f = Mat::default();
    core::dft(&real, &mut f, core::DFT_COMPLEX_OUTPUT, 0)?;
    Ok(f)
}

/// Signed frequency of DFT bin `k` out of `n`, i.e. `fftfreq(n) * n`.
#[inline]
fn fft_freq(k: usize, n: usize) -> i64 {
    if k < n.div_ceil(2) {
        k as i64
    } else {
        k as i64 - n as i64
    }
}

/// Circular correlation index to a signed shift.
#[inline]
fn wrap_index(i: usize, n: usize) -> i64 {
    if i > n / 2 { i as i64 - n as i64 } else { i as i64 }
}

struct Peak {
    row: usize,
    col: usize,
    max: f64,
    min: f64,
}

impl Peak {
    /// Uniform or all-zero inputs give a correlation surface without a peak.
    fn is_flat(&self) -> bool {
        self.max - self.min <= self.max.abs() * 1e-9
    }
}

/// First (row-major) maximum of the magnitude of a complex matrix.
fn find_peak(m: &Mat) -> Result<Peak, DriftError> {
    let cols = m.cols() as usize;
    let data = m.data_typed::<Vec2d>()?;
    let mut best = 0;
    let mut max = f64::NEG_INFINITY;
    let mut min = f64::INFINITY;
    for (i, v) in data.iter().enumerate() {
        let mag = v.0[0].hypot(v.0[1]);
        if mag > max {
            max = mag;
            best = i;
        }
        min = min.min(mag);
    }
    Ok(Peak {
        row: best / cols,
        col: best % cols,
        max,
        min,
    })
}

/// Half pixel estimate: the cross-power spectrum is zero padded to twice its
/// size (a 2x Fourier zoom of the correlation) before inverse transforming.
fn coarse_shift(product: &Mat, rows: usize, cols: usize) -> Result<ShiftVector, DriftError> {
    let (big_rows, big_cols) = (rows * 2, cols * 2);
    let src = product.data_typed::<Vec2d>()?;
    let mut big = utils::complex_from_fn(big_rows, big_cols, |_, _| (0.0, 0.0))?;
    {
        let dst = big.data_typed_mut::<Vec2d>()?;
        for r in 0..rows {
            let br = fft_freq(r, rows).rem_euclid(big_rows as i64) as usize;
            for c in 0..cols {
                let bc = fft_freq(c, cols).rem_euclid(big_cols as i64) as usize;
                dst[br * big_cols + bc] = src[r * cols + c];
            }
        }
    }
    let mut cc = Mat::default();
    core::idft(&big, &mut cc, 0, 0)?;
    let peak = find_peak(&cc)?;
    if peak.is_flat() {
        return Ok(ShiftVector::default());
    }
    Ok(ShiftVector::new(
        wrap_index(peak.row, big_rows) as f64 / 2.0,
        wrap_index(peak.col, big_cols) as f64 / 2.0,
    ))
}

/// Evaluates the correlation on a `1/usfac` grid around `coarse` and moves to its peak.
fn refine_shift(product: &Mat, coarse: ShiftVector, usfac: f64) -> Result<ShiftVector, DriftError> {
    let (rows, cols) = product.shape();
    let coarse = ShiftVector::new(
        (coarse.row * usfac).round() / usfac,
        (coarse.col * usfac).round() / usfac,
    );
    let region = (usfac * 1.5).ceil() as usize;
    let dftshift = (region / 2) as f64;

    let kern_r = utils::complex_from_fn(region, rows, |i, k| {
        let offset = i as f64 - dftshift + coarse.row * usfac;
        let phase = 2.0 * PI * fft_freq(k, rows) as f64 * offset / (rows as f64 * usfac);
        (phase.cos(), phase.sin())
    })?;
    let kern_c = utils::complex_from_fn(cols, region, |k, j| {
        let offset = j as f64 - dftshift + coarse.col * usfac;
        let phase = 2.0 * PI * fft_freq(k, cols) as f64 * offset / (cols as f64 * usfac);
        (phase.cos(), phase.sin())
    })?;

    let mut partial = Mat::default();
    core::gemm(&kern_r, product, 1.0, &core::no_array(), 0.0, &mut partial, 0)?;
    let mut cc = Mat::default();
    core::gemm(&partial, &kern_c, 1.0, &core::no_array(), 0.0, &mut cc, 0)?;

    let peak = find_peak(&cc)?;
    if peak.is_flat() {
        return Ok(coarse);
    }
    Ok(ShiftVector::new(
        coarse.row + (peak.row as f64 - dftshift) / usfac,
        coarse.col + (peak.col as f64 - dftshift) / usfac,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{mat_from_fn, roll};
    use approx::assert_abs_diff_eq;

    /// Smooth, non periodic test pattern.
    fn pattern(rows: usize, cols: usize) -> Mat {
        mat_from_fn(rows, cols, |r, c| {
            let (x, y) = (c as f64, r as f64);
            let blob = |cx: f64, cy: f64, s: f64| {
                (-((x - cx).powi(2) + (y - cy).powi(2)) / (2.0 * s * s)).exp()
            };
            100.0 * blob(20.0, 15.0, 3.0)
                + 60.0 * blob(40.0, 35.0, 5.0)
                + 80.0 * blob(12.0, 44.0, 2.0)
                + 10.0 * ((x * 0.3).sin() * (y * 0.2).cos())
        })
        .unwrap()
    }

    /// Applies a fractional circular shift via the Fourier shift theorem.
    fn fourier_shift(m: &Mat, d_row: f64, d_col: f64) -> Mat {
        let (rows, cols) = m.shape();
        let f = spectrum(m).unwrap();
        let ramp = utils::complex_from_fn(rows, cols, |r, c| {
            let phase = -2.0
                * PI
                * (fft_freq(r, rows) as f64 * d_row / rows as f64
                    + fft_freq(c, cols) as f64 * d_col / cols as f64);
            // keep the Nyquist bins hermitian so the result stays real
            if 2 * r == rows || 2 * c == cols {
                (phase.cos(), 0.0)
            } else {
                (phase.cos(), phase.sin())
            }
        })
        .unwrap();
        let mut shifted = Mat::default();
        core::mul_spectrums(&f, &ramp, &mut shifted, 0, false).unwrap();
        let mut complex = Mat::default();
        core::idft(&shifted, &mut complex, core::DFT_SCALE, 0).unwrap();
        let mut real = Mat::default();
        core::extract_channel(&complex, &mut real, 0).unwrap();
        real
    }

    #[test]
    fn identity() {
        let img = pattern(64, 48);
        for p in [1, 2, 10, 20] {
            let s = estimate_shift(&img, &img, p).unwrap();
            assert_abs_diff_eq!(s.row, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(s.col, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn integer_roll() {
        let img = pattern(64, 64);
        for (dr, dc) in [(3, -5), (-7, 2), (0, 11)] {
            let shifted = roll(&img, dr, dc).unwrap();
            let s = estimate_shift(&img, &shifted, 1).unwrap();
            assert_abs_diff_eq!(s.row, dr as f64, epsilon = 1.0);
            assert_abs_diff_eq!(s.col, dc as f64, epsilon = 1.0);
            let s = estimate_shift(&img, &shifted, 10).unwrap();
            assert_abs_diff_eq!(s.row, dr as f64, epsilon = 0.1);
            assert_abs_diff_eq!(s.col, dc as f64, epsilon = 0.1);
        }
    }

    #[test]
    fn sub_pixel_shift() {
        let img = pattern(64, 64);
        let (dr, dc) = (2.37, -4.62);
        let shifted = fourier_shift(&img, dr, dc);
        let coarse = estimate_shift(&img, &shifted, 1).unwrap();
        let fine = estimate_shift(&img, &shifted, 10).unwrap();
        let finer = estimate_shift(&img, &shifted, 50).unwrap();
        assert!((fine.row - dr).abs() <= 0.1 && (fine.col - dc).abs() <= 0.1);
        assert!((finer.row - dr).abs() <= 0.03 && (finer.col - dc).abs() <= 0.03);

        let err = |s: ShiftVector| (s.row - dr).hypot(s.col - dc);
        assert!(err(fine) <= err(coarse));
    }

    #[test]
    fn accepts_integer_depths() {
        let img = pattern(32, 32);
        let u16_img = img.convert(core::CV_16U, 100.0, 0.0).unwrap();
        let shifted = roll(&u16_img, -2, 3).unwrap().convert(core::CV_16U, 1.0, 0.0).unwrap();
        let s = estimate_shift(&u16_img, &shifted, 4).unwrap();
        assert_abs_diff_eq!(s.row, -2.0, epsilon = 0.25);
        assert_abs_diff_eq!(s.col, 3.0, epsilon = 0.25);
    }

    #[test]
    fn uniform_and_zero_images() {
        for v in [0.0, 42.0] {
            let flat = mat_from_fn(16, 16, |_, _| v).unwrap();
            for p in [1, 10] {
                let s = estimate_shift(&flat, &flat, p).unwrap();
                assert!(s.row.is_finite() && s.col.is_finite());
                assert_abs_diff_eq!(s.row, 0.0, epsilon = 1e-9);
                assert_abs_diff_eq!(s.col, 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn single_row_axis_is_zero() {
        let line = mat_from_fn(1, 32, |_, c| ((c as f64) * 0.7).sin() + (c as f64 / 5.0)).unwrap();
        let shifted = roll(&line, 0, 4).unwrap();
        let s = estimate_shift(&line, &shifted, 10).unwrap();
        assert_eq!(0.0, s.row);
        let s = estimate_shift(&line, &shifted, 1).unwrap();
        assert_eq!(0.0, s.row);
    }

    #[test]
    fn precision_below_one_is_clamped() {
        let img = pattern(32, 32);
        let shifted = roll(&img, 1, 2).unwrap();
        let clamped = estimate_shift(&img, &shifted, 0).unwrap();
        let one = estimate_shift(&img, &shifted, 1).unwrap();
        assert_eq!(one, clamped);
        assert_eq!(one, estimate_shift(&img, &shifted, -5).unwrap());
    }

    #[test]
    fn shape_mismatch_is_invalid_input() {
        let a = pattern(32, 32);
        let b = pattern(32, 31);
        assert!(matches!(
            estimate_shift(&a, &b, 1),
            Err(DriftError::InvalidInput(_))
        ));
        let mut color = Mat::default();
        core::merge(
            &core::Vector::<Mat>::from_iter([a.clone(), a.clone(), a.clone()]),
            &mut color,
        )
        .unwrap();
        assert!(matches!(
            estimate_shift(&color, &color, 1),
            Err(DriftError::InvalidInput(_))
        ));
    }

    #[test]
    fn physical_conversion_round_trip() {
        let pxs = (2e-7, 3e-7);
        let s = ShiftVector::new(1.5, -4.0);
        let p = PhysicalShift::from_pixels(s, pxs);
        let back = p.to_pixels(pxs);
        assert_abs_diff_eq!(back.row, s.row, epsilon = 1e-12);
        assert_abs_diff_eq!(back.col, s.col, epsilon = 1e-12);
        assert_abs_diff_eq!((p - p).norm(), 0.0);
        assert_abs_diff_eq!((-p + p).norm(), 0.0);
    }
}
