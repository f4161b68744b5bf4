// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use super::{Tile, common_pixel_size, top_left_px};
use crate::DriftError;
use crate::config::StitchConfig;
use crate::shift::estimate_shift;
use crate::utils::{self, MatExt, mat_from_fn};
use log::{debug, info};
use opencv::core::{self, Mat, MatTraitConst, Rect};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationMethod {
    /// Positions are trusted as they are.
    Identity,
    /// Each tile is placed against its already placed grid neighbours.
    Shift,
    /// All neighbour measurements are reconciled in one least squares solve.
    GlobalShift,
}

impl RegistrationMethod {
    pub fn registrar(self, config: &StitchConfig) -> Box<dyn Registrar> {
        match self {
            Self::Identity => Box::<IdentityRegistrar>::default(),
            Self::Shift => Box::new(ShiftRegistrar::new(config.clone())),
            Self::GlobalShift => Box::new(GlobalShiftRegistrar::new(config.clone())),
        }
    }
}

/// Collects tiles, then yields them with consistent corrected positions.
///
/// Only the main image of a tile is registered. Its dependents are moved by
/// the same amount.
pub trait Registrar {
    fn add_tile(&mut self, tile: Tile) -> Result<(), DriftError>;

    /// Returns the tiles added so far, in insertion order, with corrected
    /// positions, and empties the registrar.
    fn finish(&mut self) -> Result<Vec<Tile>, DriftError>;
}

/// Registers `tiles` with `method`. The result keeps the input order.
pub fn register(
    tiles: Vec<Tile>,
    method: RegistrationMethod,
    config: &StitchConfig,
) -> Result<Vec<Tile>, DriftError> {
    config.validate()?;
    let mut registrar = method.registrar(config);
    for tile in tiles {
        registrar.add_tile(tile)?;
    }
    registrar.finish()
}

#[derive(Debug, Default)]
pub struct IdentityRegistrar {
    tiles: Vec<Tile>,
}

impl Registrar for IdentityRegistrar {
    fn add_tile(&mut self, tile: Tile) -> Result<(), DriftError> {
        self.tiles.push(tile);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<Tile>, DriftError> {
        Ok(std::mem::take(&mut self.tiles))
    }
}

#[derive(Debug)]
pub struct ShiftRegistrar {
    tiles: Vec<Tile>,
    config: StitchConfig,
}

impl ShiftRegistrar {
    pub fn new(config: StitchConfig) -> Self {
        Self {
            tiles: Vec::new(),
            config,
        }
    }
}

impl Registrar for ShiftRegistrar {
    fn add_tile(&mut self, tile: Tile) -> Result<(), DriftError> {
        self.tiles.push(tile);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<Tile>, DriftError> {
        let tiles = std::mem::take(&mut self.tiles);
        if tiles.len() < 2 {
            return Ok(tiles);
        }
        let layout = Layout::new(&tiles)?;
        let pairs = measure_pairs(&tiles, &layout, &self.config)?;

        let solved = chain_positions(&layout, &pairs);
        Ok(layout.apply(tiles, &solved))
    }
}

#[derive(Debug)]
pub struct GlobalShiftRegistrar {
    tiles: Vec<Tile>,
    config: StitchConfig,
}

impl GlobalShiftRegistrar {
    pub fn new(config: StitchConfig) -> Self {
        Self {
            tiles: Vec::new(),
            config,
        }
    }
}

impl Registrar for GlobalShiftRegistrar {
    fn add_tile(&mut self, tile: Tile) -> Result<(), DriftError> {
        self.tiles.push(tile);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<Tile>, DriftError> {
        let tiles = std::mem::take(&mut self.tiles);
        if tiles.len() < 2 {
            return Ok(tiles);
        }
        let layout = Layout::new(&tiles)?;
        let pairs = measure_pairs(&tiles, &layout, &self.config)?;
        let solved = solve_positions(&layout, &pairs)?;
        Ok(layout.apply(tiles, &solved))
    }
}

/// Expected placement of the tiles, in global pixels.
struct Layout {
    pixel_size: (f64, f64),
    /// `(row, col)` of each top left corner
    top_left: Vec<(f64, f64)>,
    /// `(row, col)` index of each tile in the inferred grid
    grid: Vec<(usize, usize)>,
}

impl Layout {
    fn new(tiles: &[Tile]) -> Result<Self, DriftError> {
        let pixel_size = common_pixel_size(tiles)?;
        let top_left: Vec<_> = tiles
            .iter()
            .map(|t| top_left_px(&t.image, pixel_size))
            .collect();
        let min_rows = tiles.iter().map(|t| t.image.shape().0).min().unwrap_or(1);
        let min_cols = tiles.iter().map(|t| t.image.shape().1).min().unwrap_or(1);
        let rows = cluster(top_left.iter().map(|p| p.0), min_rows as f64 / 2.0);
        let cols = cluster(top_left.iter().map(|p| p.1), min_cols as f64 / 2.0);
        let grid = rows.into_iter().zip(cols).collect();
        Ok(Self {
            pixel_size,
            top_left,
            grid,
        })
    }

    /// Moves every tile so that its top left corner lands on `solved`.
    fn apply(&self, tiles: Vec<Tile>, solved: &[(f64, f64)]) -> Vec<Tile> {
        tiles
            .into_iter()
            .enumerate()
            .map(|(i, tile)| {
                let d_row = solved[i].0 - self.top_left[i].0;
                let d_col = solved[i].1 - self.top_left[i].1;
                tile.translated((d_col * self.pixel_size.0, -d_row * self.pixel_size.1))
            })
            .collect()
    }
}

/// Groups 1d coordinates into ordered bins: a new bin starts whenever a value
/// is more than `tolerance` past the first value of the current bin.
fn cluster(values: impl Iterator<Item = f64>, tolerance: f64) -> Vec<usize> {
    let values: Vec<f64> = values.collect();
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| OrderedFloat(values[i]));
    let mut bins = vec![0; values.len()];
    let mut bin = 0;
    let mut start = None;
    for i in order {
        match start {
            Some(s) if values[i] - s <= tolerance => {}
            Some(_) => {
                bin += 1;
                start = Some(values[i]);
            }
            None => start = Some(values[i]),
        }
        bins[i] = bin;
    }
    bins
}

/// Relative placement of two grid neighbours, `b` right of or below `a`.
#[derive(Debug, Clone, Copy)]
struct PairOffset {
    a: usize,
    b: usize,
    /// `top_left[b] - top_left[a]` from the reported positions
    expected: (f64, f64),
    /// the same, measured on the overlap; `None` if the overlap is too small
    measured: Option<(f64, f64)>,
}

/// Measures the offset of every pair of grid neighbours. The overlap crops
/// are cut sequentially, the shift estimation runs in parallel.
fn measure_pairs(
    tiles: &[Tile],
    layout: &Layout,
    config: &StitchConfig,
) -> Result<Vec<PairOffset>, DriftError> {
    let greys = tiles
        .iter()
        .map(|t| t.image.to_grey_f64())
        .collect::<Result<Vec<_>, _>>()?;

    let mut pairs = Vec::new();
    let mut jobs = Vec::new();
    for a in 0..tiles.len() {
        for b in 0..tiles.len() {
            let (ga, gb) = (layout.grid[a], layout.grid[b]);
            let right = ga.0 == gb.0 && ga.1 + 1 == gb.1;
            let below = ga.1 == gb.1 && ga.0 + 1 == gb.0;
            if !(right || below) {
                continue;
            }
            let expected = (
                layout.top_left[b].0 - layout.top_left[a].0,
                layout.top_left[b].1 - layout.top_left[a].1,
            );
            match overlap_crops(&greys[a], &greys[b], expected, config.min_overlap_px)? {
                Some((crop_a, crop_b, d)) => jobs.push((pairs.len(), crop_a, crop_b, d)),
                None => debug!("tiles {a} and {b} overlap too little, keeping their offset"),
            }
            pairs.push(PairOffset {
                a,
                b,
                expected,
                measured: None,
            });
        }
    }

    let precision = config.precision;
    let measured = jobs
        .into_par_iter()
        .map(|(index, crop_a, crop_b, d)| -> Result<_, DriftError> {
            let shift = estimate_shift(&crop_a, &crop_b, precision)?;
            Ok((index, (d.0 - shift.row, d.1 - shift.col)))
        })
        .collect::<Result<Vec<_>, DriftError>>()?;
    for (index, offset) in measured {
        let p = &mut pairs[index];
        debug!(
            "tiles {} -> {}: expected {:?}, measured {offset:?}",
            p.a, p.b, p.expected
        );
        p.measured = Some(offset);
    }
    Ok(pairs)
}

/// Cuts the expected overlap of `b` placed `offset` `(row, col)` pixels from
/// `a` out of both, mean removed. Also returns the integer offset used.
fn overlap_crops(
    a: &Mat,
    b: &Mat,
    offset: (f64, f64),
    min_overlap: usize,
) -> Result<Option<(Mat, Mat, (f64, f64))>, DriftError> {
    let (a_rows, a_cols) = a.shape();
    let (b_rows, b_cols) = b.shape();
    let d_row = offset.0.round() as i64;
    let d_col = offset.1.round() as i64;
    let r0 = d_row.max(0);
    let r1 = (a_rows as i64).min(d_row + b_rows as i64);
    let c0 = d_col.max(0);
    let c1 = (a_cols as i64).min(d_col + b_cols as i64);
    if r1 - r0 < min_overlap as i64 || c1 - c0 < min_overlap as i64 {
        return Ok(None);
    }
    let (h, w) = ((r1 - r0) as i32, (c1 - c0) as i32);
    let crop_a = utils::crop(a, Rect::new(c0 as i32, r0 as i32, w, h))?;
    let crop_b = utils::crop(b, Rect::new((c0 - d_col) as i32, (r0 - d_row) as i32, w, h))?;
    Ok(Some((
        without_mean(&crop_a)?,
        without_mean(&crop_b)?,
        (d_row as f64, d_col as f64),
    )))
}

fn without_mean(m: &Mat) -> Result<Mat, DriftError> {
    let mean = core::mean(m, &core::no_array())?;
    m.convert(core::CV_64FC1, 1.0, -mean.0[0])
}

/// Top left corners placed in grid order, each tile at the mean of what its
/// already placed neighbours measure. A tile without a measured placed
/// neighbour keeps its reported position.
fn chain_positions(layout: &Layout, pairs: &[PairOffset]) -> Vec<(f64, f64)> {
    let n = layout.top_left.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| layout.grid[i]);
    let mut placed: Vec<Option<(f64, f64)>> = vec![None; n];
    for &k in &order {
        let candidates: Vec<(f64, f64)> = pairs
            .iter()
            .filter_map(|p| {
                let m = p.measured?;
                if p.b == k {
                    placed[p.a].map(|a| (a.0 + m.0, a.1 + m.1))
                } else if p.a == k {
                    placed[p.b].map(|b| (b.0 - m.0, b.1 - m.1))
                } else {
                    None
                }
            })
            .collect();
        placed[k] = Some(if candidates.is_empty() {
            layout.top_left[k]
        } else {
            let count = candidates.len() as f64;
            let sum = candidates
                .iter()
                .fold((0.0, 0.0), |acc, c| (acc.0 + c.0, acc.1 + c.1));
            (sum.0 / count, sum.1 / count)
        });
    }
    placed
        .into_iter()
        .zip(&layout.top_left)
        .map(|(p, expected)| p.unwrap_or(*expected))
        .collect()
}

/// Least squares top left corners honouring every pair offset (measured when
/// available, expected otherwise). The first tile of each connected group
/// keeps its reported position.
fn solve_positions(layout: &Layout, pairs: &[PairOffset]) -> Result<Vec<(f64, f64)>, DriftError> {
    let n = layout.top_left.len();
    let mut groups = UnionFind::new(n);
    for p in pairs {
        groups.union(p.a, p.b);
    }
    // roots are the smallest index of their group
    let anchors: Vec<usize> = (0..n).filter(|&i| groups.find(i) == i).collect();

    let equations = pairs.len() + anchors.len();
    let coefficient = |eq: usize, unknown: usize| -> f64 {
        if eq < pairs.len() {
            let p = &pairs[eq];
            if unknown == p.b {
                1.0
            } else if unknown == p.a {
                -1.0
            } else {
                0.0
            }
        } else if anchors[eq - pairs.len()] == unknown {
            1.0
        } else {
            0.0
        }
    };
    let target = |eq: usize, axis: usize| -> f64 {
        if eq < pairs.len() {
            let p = &pairs[eq];
            let o = p.measured.unwrap_or(p.expected);
            if axis == 0 { o.0 } else { o.1 }
        } else {
            let t = layout.top_left[anchors[eq - pairs.len()]];
            if axis == 0 { t.0 } else { t.1 }
        }
    };
    let lhs = mat_from_fn(equations, n, coefficient)?;
    let rhs = mat_from_fn(equations, 2, target)?;
    let mut solution = Mat::default();
    if !core::solve(&lhs, &rhs, &mut solution, core::DECOMP_SVD)? {
        return Err(DriftError::ProcessingError(
            "tile position system is singular".to_string(),
        ));
    }
    let mut solved = Vec::with_capacity(n);
    for i in 0..n {
        solved.push((
            *solution.at_2d::<f64>(i as i32, 0)?,
            *solution.at_2d::<f64>(i as i32, 1)?,
        ));
    }
    let worst = solved
        .iter()
        .zip(&layout.top_left)
        .map(|(s, t)| OrderedFloat((s.0 - t.0).hypot(s.1 - t.1)))
        .max()
        .unwrap_or_default();
    info!(
        "global registration of {n} tiles from {} pairs, largest correction {:.2} px",
        pairs.len(),
        worst.0
    );
    Ok(solved)
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_tiles::{grid, tile};
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Top left corner of a registered tile, in scene pixels.
    fn corner(t: &Tile) -> (f64, f64) {
        top_left_px(&t.image, (1.0, 1.0))
    }

    #[test]
    fn grid_inference() {
        let bins = cluster([0.0, 40.2, 39.8, 0.3, 80.0].into_iter(), 30.0);
        assert_eq!(vec![0, 1, 1, 0, 2], bins);
    }

    #[test]
    fn identity_keeps_positions() {
        let tiles = grid([(0.0, 0.0), (1.0, 2.0), (0.0, 0.0), (0.0, 0.0)]);
        let before: Vec<_> = tiles.iter().map(|t| t.position()).collect();
        let after = register(tiles, RegistrationMethod::Identity, &StitchConfig::default()).unwrap();
        let after: Vec<_> = after.iter().map(|t| t.position()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn shift_corrects_misplaced_tiles() {
        let tiles = grid([(0.0, 0.0), (2.0, -1.0), (-1.0, 2.0), (0.0, 0.0)]);
        let out = register(tiles, RegistrationMethod::Shift, &StitchConfig::default()).unwrap();
        let expected = [(0.0, 0.0), (0.0, 40.0), (40.0, 0.0), (40.0, 40.0)];
        for (t, e) in out.iter().zip(expected) {
            let c = corner(t);
            assert_abs_diff_eq!(e.0, c.0, epsilon = 0.5);
            assert_abs_diff_eq!(e.1, c.1, epsilon = 0.5);
        }
    }

    #[test]
    fn global_shift_corrects_misplaced_tiles() {
        let tiles = grid([(0.0, 0.0), (1.5, 1.0), (0.0, -2.0), (-1.0, 1.0)]);
        let out =
            register(tiles, RegistrationMethod::GlobalShift, &StitchConfig::default()).unwrap();
        let expected = [(0.0, 0.0), (0.0, 40.0), (40.0, 0.0), (40.0, 40.0)];
        for (t, e) in out.iter().zip(expected) {
            let c = corner(t);
            assert_abs_diff_eq!(e.0, c.0, epsilon = 0.5);
            assert_abs_diff_eq!(e.1, c.1, epsilon = 0.5);
        }
    }

    #[test]
    fn dependents_follow_their_tile() {
        let mut tiles = grid([(0.0, 0.0), (0.0, 2.0), (0.0, 0.0), (0.0, 0.0)]);
        let companion = tiles[1].image.clone();
        tiles[1] = tiles[1].clone().with_dependents(vec![companion]);
        let before = tiles[1].position();
        let out =
            register(tiles, RegistrationMethod::GlobalShift, &StitchConfig::default()).unwrap();
        let after = out[1].position();
        assert_abs_diff_eq!(before.0 - 2.0, after.0, epsilon = 0.5);
        assert_eq!(after, out[1].dependents[0].position());
    }

    /// A 3x3 grid at 40 px pitch where every neighbour pair is measured
    /// exactly, except tile 0 -> tile 1 which is 6 px too long in x.
    fn grid_with_one_bad_pair() -> (Layout, Vec<PairOffset>) {
        let top_left: Vec<(f64, f64)> = (0..9)
            .map(|i| (40.0 * (i / 3) as f64, 40.0 * (i % 3) as f64))
            .collect();
        let grid = (0..9).map(|i| (i / 3, i % 3)).collect();
        let mut pairs = Vec::new();
        for a in 0..9 {
            for b in [a + 1, a + 3] {
                let right = b == a + 1 && a % 3 != 2;
                let below = b == a + 3 && b < 9;
                if !(right || below) {
                    continue;
                }
                let expected = (
                    top_left[b].0 - top_left[a].0,
                    top_left[b].1 - top_left[a].1,
                );
                let error = if (a, b) == (0, 1) { 6.0 } else { 0.0 };
                pairs.push(PairOffset {
                    a,
                    b,
                    expected,
                    measured: Some((expected.0, expected.1 + error)),
                });
            }
        }
        let layout = Layout {
            pixel_size: (1.0, 1.0),
            top_left,
            grid,
        };
        (layout, pairs)
    }

    fn largest_error(layout: &Layout, solved: &[(f64, f64)]) -> f64 {
        solved
            .iter()
            .zip(&layout.top_left)
            .map(|(s, t)| (s.0 - t.0).hypot(s.1 - t.1))
            .fold(0.0, f64::max)
    }

    #[test]
    fn global_solve_spreads_a_conflicting_pair() {
        let (layout, pairs) = grid_with_one_bad_pair();
        assert_eq!(12, pairs.len());

        // chaining carries the whole error along the first row
        let chained = chain_positions(&layout, &pairs);
        assert_abs_diff_eq!(6.0, largest_error(&layout, &chained), epsilon = 1e-9);
        assert_abs_diff_eq!(86.0, chained[2].1, epsilon = 1e-9);

        // the other loops through tiles 0 and 1 outvote the bad pair
        let solved = solve_positions(&layout, &pairs).unwrap();
        let worst = largest_error(&layout, &solved);
        assert!(worst < 4.5, "{worst}");
        assert!(solved[1].1 - solved[0].1 < 46.0 - 1.0);
        assert_eq!((0.0, 0.0), (solved[0].0.round(), solved[0].1.round()));
    }

    #[test]
    fn small_overlaps_keep_reported_offsets() {
        // 5 px of overlap, below the default minimum
        let tiles = vec![tile(0, 0, 60, (0.0, 0.0)), tile(0, 55, 60, (0.0, 1.0))];
        let before: Vec<_> = tiles.iter().map(|t| t.position()).collect();
        for method in [RegistrationMethod::Shift, RegistrationMethod::GlobalShift] {
            let out = register(tiles.clone(), method, &StitchConfig::default()).unwrap();
            let after: Vec<_> = out.iter().map(|t| t.position()).collect();
            assert_abs_diff_eq!(before[1].0, after[1].0, epsilon = 1e-9);
            assert_abs_diff_eq!(before[1].1, after[1].1, epsilon = 1e-9);
        }
    }
}
