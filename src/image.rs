// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Intensity images with the acquisition metadata needed to turn pixel
//! displacements into physical ones.

use crate::DriftError;
use crate::utils::{self, MatExt};
use opencv::core::{Mat, MatTraitConst};
use std::time::{Duration, SystemTime};

/// Acquisition metadata attached to every [`Image`].
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Physical size of one pixel `(x, y)` in meters.
    pub pixel_size: (f64, f64),
    /// Physical position `(x, y)` of the image centre in meters, Y pointing up.
    pub position: (f64, f64),
    /// Wall clock time of the capture.
    pub acquired_at: Option<SystemTime>,
    /// Per-pixel dwell time of a scanned acquisition.
    pub dwell_time: Option<Duration>,
    /// Exposure time of a camera acquisition.
    pub exposure_time: Option<Duration>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            pixel_size: (1.0, 1.0),
            position: (0.0, 0.0),
            acquired_at: None,
            dwell_time: None,
            exposure_time: None,
        }
    }
}

impl Metadata {
    pub fn with_pixel_size(mut self, pixel_size: (f64, f64)) -> Self {
        self.pixel_size = pixel_size;
        self
    }

    pub fn with_position(mut self, position: (f64, f64)) -> Self {
        self.position = position;
        self
    }
}

/// A 2d (optionally multi channel) intensity image and its metadata.
///
/// Images are never modified once created: methods that "change" an image
/// consume it and return a new one.
#[derive(Debug, Clone)]
pub struct Image {
    data: Mat,
    metadata: Metadata,
}

impl Image {
    /// Wraps `data`. Fails on empty matrices and on non positive pixel sizes.
    pub fn new(data: Mat, metadata: Metadata) -> Result<Self, DriftError> {
        if data.empty() || data.dims() != 2 {
            return Err(DriftError::InvalidInput(
                "an image needs non-empty 2d data".to_string(),
            ));
        }
        let (px, py) = metadata.pixel_size;
        if !(px > 0.0 && py > 0.0 && px.is_finite() && py.is_finite()) {
            return Err(DriftError::InvalidInput(format!(
                "pixel size must be positive, got ({px}, {py})"
            )));
        }
        Ok(Self { data, metadata })
    }

    #[inline]
    pub fn data(&self) -> &Mat {
        &self.data
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// `(rows, cols)`
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.data.shape()
    }

    #[inline]
    pub fn pixel_size(&self) -> (f64, f64) {
        self.metadata.pixel_size
    }

    #[inline]
    pub fn position(&self) -> (f64, f64) {
        self.metadata.position
    }

    /// Returns the same pixels with a new physical position.
    pub fn with_position(mut self, position: (f64, f64)) -> Self {
        self.metadata.position = position;
        self
    }

    /// Single channel `CV_64FC1` copy of the pixels, see [`utils::to_grey_f64()`].
    pub fn to_grey_f64(&self) -> Result<Mat, DriftError> {
        utils::to_grey_f64(&self.data)
    }

    /// Physical size `(width, height)` covered by the image, in meters.
    pub fn physical_extent(&self) -> (f64, f64) {
        let (rows, cols) = self.shape();
        (
            cols as f64 * self.metadata.pixel_size.0,
            rows as f64 * self.metadata.pixel_size.1,
        )
    }
}
