// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Tile stitching: [`register()`] corrects the physical positions of
//! overlapping tiles, [`weave()`] composes them into one image.
//!
//! Tile positions are the physical centres of the images (Y up). Internally
//! positions are handled in "global pixels" of the first tile's pixel size,
//! columns along X and rows against Y.

mod registration;
mod weaving;

pub use registration::{
    GlobalShiftRegistrar, IdentityRegistrar, Registrar, RegistrationMethod, ShiftRegistrar,
    register,
};
pub use weaving::{WeavingMethod, weave};

use crate::DriftError;
use crate::image::Image;

/// An image to stitch, with the images that move rigidly with it.
///
/// Dependent images (e.g. other channels of the same area) keep their offset
/// to the main image through registration.
#[derive(Debug, Clone)]
pub struct Tile {
    pub image: Image,
    pub dependents: Vec<Image>,
}

impl Tile {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            dependents: Vec::new(),
        }
    }

    pub fn with_dependents(mut self, dependents: Vec<Image>) -> Self {
        self.dependents = dependents;
        self
    }

    /// Physical position `(x, y)` of the main image centre.
    pub fn position(&self) -> (f64, f64) {
        self.image.position()
    }

    /// Moves the main image and every dependent by `delta` meters.
    pub(crate) fn translated(self, delta: (f64, f64)) -> Self {
        let moved = |img: Image| {
            let (x, y) = img.position();
            img.with_position((x + delta.0, y + delta.1))
        };
        Self {
            image: moved(self.image),
            dependents: self.dependents.into_iter().map(moved).collect(),
        }
    }
}

/// Top left corner of `image` in global pixels of size `pixel_size`.
pub(crate) fn top_left_px(image: &Image, pixel_size: (f64, f64)) -> (f64, f64) {
    let (rows, cols) = image.shape();
    let (x, y) = image.position();
    (
        -y / pixel_size.1 - rows as f64 / 2.0,
        x / pixel_size.0 - cols as f64 / 2.0,
    )
}

/// Pixel size shared by all `tiles`.
pub(crate) fn common_pixel_size(tiles: &[Tile]) -> Result<(f64, f64), DriftError> {
    let Some(first) = tiles.first() else {
        return Err(DriftError::InvalidInput("no tiles".to_string()));
    };
    let pxs = first.image.pixel_size();
    let close = |a: f64, b: f64| (a - b).abs() <= a.abs().max(b.abs()) * 1e-6;
    for t in tiles {
        let p = t.image.pixel_size();
        if !close(p.0, pxs.0) || !close(p.1, pxs.1) {
            return Err(DriftError::InvalidInput(format!(
                "tiles must share one pixel size, got {pxs:?} and {p:?}"
            )));
        }
    }
    Ok(pxs)
}

#[cfg(test)]
pub(crate) mod test_tiles {
    use super::*;
    use crate::image::Metadata;
    use crate::utils::mat_from_fn;

    /// Smooth, non periodic test scene, `(row, col)` in global pixels.
    pub fn scene(r: f64, c: f64) -> f64 {
        let blob = |r0: f64, c0: f64, s: f64| {
            (-((r - r0).powi(2) + (c - c0).powi(2)) / (2.0 * s * s)).exp()
        };
        100.0 * blob(20.0, 30.0, 4.0)
            + 80.0 * blob(45.0, 55.0, 3.0)
            + 60.0 * blob(70.0, 25.0, 5.0)
            + 90.0 * blob(30.0, 75.0, 3.5)
            + 70.0 * blob(75.0, 80.0, 4.5)
            + 50.0 * blob(55.0, 45.0, 2.5)
    }

    /// A `size` square crop of [`scene`] whose top left corner is at
    /// `(row, col)`, labelled with the position of `(row + err.0, col + err.1)`.
    pub fn tile(row: usize, col: usize, size: usize, err: (f64, f64)) -> Tile {
        let data = mat_from_fn(size, size, |r, c| scene((row + r) as f64, (col + c) as f64))
            .unwrap();
        let half = size as f64 / 2.0;
        let position = (col as f64 + err.1 + half, -(row as f64 + err.0 + half));
        Tile::new(Image::new(data, Metadata::default().with_position(position)).unwrap())
    }

    /// 2x2 grid of 60 px tiles at a 40 px pitch.
    pub fn grid(errors: [(f64, f64); 4]) -> Vec<Tile> {
        vec![
            tile(0, 0, 60, errors[0]),
            tile(0, 40, 60, errors[1]),
            tile(40, 0, 60, errors[2]),
            tile(40, 40, 60, errors[3]),
        ]
    }
}
