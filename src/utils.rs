// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::DriftError;
use opencv::core::{self, AlgorithmHint, Mat, MatTrait, MatTraitConst, Rect, Scalar, Vec2d};
use opencv::imgproc;
use std::sync::{Mutex, MutexGuard};

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with scaling
    ///
    /// # Arguments
    /// * `rtype` - OpenCV type constant (e.g., CV_32F, CV_64F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, DriftError>;

    /// `(rows, cols)` of a 2d matrix, as `usize`
    fn shape(&self) -> (usize, usize);
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, DriftError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }

    #[inline]
    fn shape(&self) -> (usize, usize) {
        (self.rows().max(0) as usize, self.cols().max(0) as usize)
    }
}

/// Builds a `CV_64FC1` matrix by evaluating `f(row, col)` for every pixel.
/// ```
/// # use libdrift::utils::mat_from_fn;
/// # use libdrift::opencv::prelude::*;
/// let m = mat_from_fn(2, 3, |r, c| (r * 10 + c) as f64).unwrap();
/// assert_eq!(12.0, *m.at_2d::<f64>(1, 2).unwrap());
/// ```
pub fn mat_from_fn<F>(rows: usize, cols: usize, mut f: F) -> Result<Mat, DriftError>
where
    F: FnMut(usize, usize) -> f64,
{
    let mut m =
        Mat::new_rows_cols_with_default(rows as i32, cols as i32, core::CV_64FC1, Scalar::all(0.0))?;
    if cols > 0 {
        let data = m.data_typed_mut::<f64>()?;
        for (i, v) in data.iter_mut().enumerate() {
            *v = f(i / cols, i % cols);
        }
    }
    Ok(m)
}

/// Builds a `CV_64FC2` (complex) matrix by evaluating `f(row, col) -> (re, im)`.
pub(crate) fn complex_from_fn<F>(rows: usize, cols: usize, mut f: F) -> Result<Mat, DriftError>
where
    F: FnMut(usize, usize) -> (f64, f64),
{
    let mut m =
        Mat::new_rows_cols_with_default(rows as i32, cols as i32, core::CV_64FC2, Scalar::all(0.0))?;
    if cols > 0 {
        let data = m.data_typed_mut::<Vec2d>()?;
        for (i, v) in data.iter_mut().enumerate() {
            let (re, im) = f(i / cols, i % cols);
            v.0[0] = re;
            v.0[1] = im;
        }
    }
    Ok(m)
}

/// Returns a continuous single channel `CV_64FC1` copy of `src`.
///
/// Three and four channel images are treated as BGR(A) and converted to grey,
/// other multi channel images are reduced to their first channel.
pub fn to_grey_f64(src: &Mat) -> Result<Mat, DriftError> {
    let grey = match src.channels() {
        1 => return src.convert(core::CV_64FC1, 1.0, 0.0),
        3 | 4 => {
            // cvt_color only accepts 8U, 16U and 32F input
            let as_f32 = src.convert(core::CV_32F, 1.0, 0.0)?;
            let mut grey = Mat::default();
            let code = if src.channels() == 3 {
                imgproc::COLOR_BGR2GRAY
            } else {
                imgproc::COLOR_BGRA2GRAY
            };
            imgproc::cvt_color(&as_f32, &mut grey, code, 0, AlgorithmHint::ALGO_HINT_DEFAULT)?;
            grey
        }
        _ => {
            let mut first = Mat::default();
            core::extract_channel(src, &mut first, 0)?;
            first
        }
    };
    grey.convert(core::CV_64FC1, 1.0, 0.0)
}

/// Min-max rescales a single channel image into `CV_8UC1`.
pub fn to_u8_scaled(src: &Mat) -> Result<Mat, DriftError> {
    let mut dst = Mat::default();
    core::normalize(
        src,
        &mut dst,
        0.0,
        255.0,
        core::NORM_MINMAX,
        core::CV_8U,
        &core::no_array(),
    )?;
    Ok(dst)
}

/// Returns a continuous copy of the `rect` sub-region of `src`.
pub fn crop(src: &Mat, rect: Rect) -> Result<Mat, DriftError> {
    if rect.x < 0
        || rect.y < 0
        || rect.width <= 0
        || rect.height <= 0
        || rect.x + rect.width > src.cols()
        || rect.y + rect.height > src.rows()
    {
        return Err(DriftError::InvalidParams(format!(
            "crop {rect:?} outside of {}x{} image",
            src.cols(),
            src.rows()
        )));
    }
    Ok(Mat::roi(src, rect)?.try_clone()?)
}

/// Circular shift of a single channel image: pixel `(r, c)` moves to
/// `(r + d_row, c + d_col)`, wrapping around the borders.
/// ```
/// # use libdrift::utils::{mat_from_fn, roll};
/// # use libdrift::opencv::prelude::*;
/// let m = mat_from_fn(3, 3, |r, c| (r * 3 + c) as f64).unwrap();
/// let rolled = roll(&m, 1, -1).unwrap();
/// assert_eq!(*m.at_2d::<f64>(0, 1).unwrap(), *rolled.at_2d::<f64>(1, 0).unwrap());
/// assert_eq!(*m.at_2d::<f64>(2, 0).unwrap(), *rolled.at_2d::<f64>(0, 2).unwrap());
/// ```
pub fn roll(src: &Mat, d_row: i64, d_col: i64) -> Result<Mat, DriftError> {
    let src = to_grey_f64(src)?;
    let (rows, cols) = src.shape();
    let data = src.data_typed::<f64>()?;
    mat_from_fn(rows, cols, |r, c| {
        let sr = (r as i64 - d_row).rem_euclid(rows as i64) as usize;
        let sc = (c as i64 - d_col).rem_euclid(cols as i64) as usize;
        data[sr * cols + sc]
    })
}

/// Locks `m`, recovering the data of a poisoned lock. Only used for locks
/// guarding plain state that a panicking holder cannot leave half written.
pub(crate) fn lock<S>(m: &Mutex<S>) -> MutexGuard<'_, S> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
