// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::{Tile, common_pixel_size, top_left_px};
use crate::DriftError;
use crate::image::Image;
use crate::utils::{MatExt, mat_from_fn};
use log::debug;
use opencv::core::MatTraitConst;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeavingMethod {
    /// Overlaps are the pixel-wise mean of the tiles covering them.
    Mean,
    /// Tiles are pasted in order, later tiles cover earlier ones.
    Collage,
    /// Tiles are pasted in reverse order, the first tile ends on top.
    CollageReverse,
}

/// A tile's pixels, placed on the composite canvas.
struct Placed {
    row: usize,
    col: usize,
    rows: usize,
    cols: usize,
    pixels: Vec<f64>,
}

impl Placed {
    fn canvas_indices(&self, canvas_cols: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows).flat_map(move |r| {
            (0..self.cols).map(move |c| ((self.row + r) * canvas_cols + self.col + c, r * self.cols + c))
        })
    }
}

/// Composes the main images of `tiles` into one single channel `CV_64F`
/// image, each tile placed at its position rounded to whole pixels.
///
/// With `adjust_brightness` each tile is first scaled so that its mean over
/// the area it shares with the previous tiles matches theirs.
///
/// The composite has the pixel size of the tiles and is positioned at the
/// centre of their union. Pixels covered by no tile are 0.
pub fn weave(
    tiles: &[Tile],
    method: WeavingMethod,
    adjust_brightness: bool,
) -> Result<Image, DriftError> {
    let pixel_size = common_pixel_size(tiles)?;

    let corners: Vec<(i64, i64)> = tiles
        .iter()
        .map(|t| {
            let (r, c) = top_left_px(&t.image, pixel_size);
            (r.round() as i64, c.round() as i64)
        })
        .collect();
    let top = corners.iter().map(|c| c.0).min().unwrap_or(0);
    let left = corners.iter().map(|c| c.1).min().unwrap_or(0);
    let mut bottom = top;
    let mut right = left;
    for (t, c) in tiles.iter().zip(&corners) {
        let (rows, cols) = t.image.shape();
        bottom = bottom.max(c.0 + rows as i64);
        right = right.max(c.1 + cols as i64);
    }
    let (canvas_rows, canvas_cols) = ((bottom - top) as usize, (right - left) as usize);

    let mut placed = Vec::with_capacity(tiles.len());
    for (t, c) in tiles.iter().zip(&corners) {
        let grey = t.image.to_grey_f64()?;
        let grey = if grey.is_continuous() {
            grey
        } else {
            grey.try_clone()?
        };
        let (rows, cols) = grey.shape();
        placed.push(Placed {
            row: (c.0 - top) as usize,
            col: (c.1 - left) as usize,
            rows,
            cols,
            pixels: grey.data_typed::<f64>()?.to_vec(),
        });
    }

    let mut sum = vec![0.0; canvas_rows * canvas_cols];
    let mut count = vec![0u32; canvas_rows * canvas_cols];
    for (i, p) in placed.iter_mut().enumerate() {
        if adjust_brightness {
            let gain = brightness_gain(p, &sum, &count, canvas_cols);
            if gain != 1.0 {
                debug!("tile {i}: brightness gain {gain:.4}");
                p.pixels.iter_mut().for_each(|v| *v *= gain);
            }
        }
        for (dst, src) in p.canvas_indices(canvas_cols) {
            sum[dst] += p.pixels[src];
            count[dst] += 1;
        }
    }

    let out = match method {
        WeavingMethod::Mean => sum
            .iter()
            .zip(&count)
            .map(|(s, &n)| if n > 0 { s / n as f64 } else { 0.0 })
            .collect(),
        WeavingMethod::Collage => paste(placed.iter(), canvas_rows, canvas_cols),
        WeavingMethod::CollageReverse => paste(placed.iter().rev(), canvas_rows, canvas_cols),
    };
    let data = mat_from_fn(canvas_rows, canvas_cols, |r, c| out[r * canvas_cols + c])?;

    let mut metadata = tiles[0].image.metadata().clone();
    metadata.pixel_size = pixel_size;
    metadata.position = (
        (left as f64 + canvas_cols as f64 / 2.0) * pixel_size.0,
        -(top as f64 + canvas_rows as f64 / 2.0) * pixel_size.1,
    );
    debug!(
        "wove {} tiles into {canvas_rows}x{canvas_cols} with {method:?}",
        tiles.len()
    );
    Image::new(data, metadata)
}

/// Ratio of the mean of what is already on the canvas to the mean of the
/// tile, over the pixels they share. `1` without overlap.
fn brightness_gain(tile: &Placed, sum: &[f64], count: &[u32], canvas_cols: usize) -> f64 {
    let mut canvas_total = 0.0;
    let mut tile_total = 0.0;
    let mut shared = 0usize;
    for (dst, src) in tile.canvas_indices(canvas_cols) {
        if count[dst] > 0 {
            canvas_total += sum[dst] / count[dst] as f64;
            tile_total += tile.pixels[src];
            shared += 1;
        }
    }
    if shared == 0 || tile_total.abs() <= f64::EPSILON * shared as f64 {
        return 1.0;
    }
    canvas_total / tile_total
}

fn paste<'a>(
    tiles: impl Iterator<Item = &'a Placed>,
    canvas_rows: usize,
    canvas_cols: usize,
) -> Vec<f64> {
    let mut out = vec![0.0; canvas_rows * canvas_cols];
    for p in tiles {
        for (dst, src) in p.canvas_indices(canvas_cols) {
            out[dst] = p.pixels[src];
        }
    }
    out
}
