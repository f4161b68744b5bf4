// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Anchor based drift correction.
//!
//! During a long acquisition a small anchor region, away from the area being
//! imaged, is rescanned periodically. Each rescan is registered against the
//! very first one (the session reference) to measure how far the sample has
//! drifted since the start, and the host acquisition offsets its scan by the
//! opposite of that vector.
//!
//! ```text
//!   Idle --arm()--> Armed --tick()--> Tracking --complete()--> Completed
//!     \               \                  \
//!      `---------------`------------------`--cancel()--> Cancelled
//! ```

use crate::DriftError;
use crate::anchor::{AnchorRegion, Roi};
use crate::config::DriftConfig;
use crate::hardware::{ScanPair, ScanSettings, acquire_frame};
use crate::image::Image;
use crate::shift::{PhysicalShift, ShiftVector, estimate_shift};
use crate::task::CancellableTask;
use crate::utils::{MatExt, lock};
use log::{debug, error, info, warn};
use opencv::core::Mat;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A periodic side task run by a host acquisition.
///
/// The host calls [`Leech::start()`] once before it starts, then
/// [`Leech::next()`] every time it has acquired the number of pixels the
/// previous call asked for, and [`Leech::complete()`] when it is done.
pub trait Leech {
    /// Prepares the leech for an acquisition of `shape` `(rows, cols)` pixels
    /// lasting about `estimated_total_time`. Returns after how many pixels
    /// `next()` should be called, `None` if never.
    fn start(
        &mut self,
        estimated_total_time: Duration,
        shape: (usize, usize),
    ) -> Result<Option<usize>, DriftError>;

    /// Called with the frames acquired so far. Returns the number of pixels
    /// until the following call, `None` if no more calls are wanted.
    fn next(&mut self, raw_data: &[Image]) -> Result<Option<usize>, DriftError>;

    /// Called once with the complete acquisition.
    fn complete(&mut self, raw_data: &[Image]) -> Result<(), DriftError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStatus {
    Idle,
    /// The reference anchor image is captured.
    Armed,
    /// At least one correction was attempted.
    Tracking,
    Completed,
    Cancelled,
}

/// Outcome of one [`AnchorDriftCorrector::tick()`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftMeasurement {
    /// One based index of the tick.
    pub tick: usize,
    /// Drift since the session reference, in meters. The host should offset
    /// its scan by the negative of this vector.
    pub cumulative: PhysicalShift,
    /// Drift since the previous anchor capture. Diagnostics only, zero on a
    /// stale tick.
    pub incremental: PhysicalShift,
    /// `cumulative` in pixels of the anchor image grid.
    pub cumulative_px: ShiftVector,
    /// `true` when this tick's capture failed, or delivered an unusable
    /// frame, and the previous correction is reported again.
    pub stale: bool,
}

#[derive(Default)]
struct SharedCancel {
    cancelled: AtomicBool,
    in_flight: Mutex<Option<CancellableTask<Image>>>,
}

impl SharedCancel {
    fn cancel(&self) -> bool {
        let task = {
            let mut in_flight = lock(&self.in_flight);
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return false;
            }
            in_flight.take()
        };
        if let Some(task) = task {
            let _ = task.cancel();
        }
        true
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancels an [`AnchorDriftCorrector`] from another thread, e.g. while the
/// acquisition thread is blocked in [`AnchorDriftCorrector::tick()`].
#[derive(Clone)]
pub struct DriftCanceller(Arc<SharedCancel>);

impl DriftCanceller {
    /// Cancels the session and its in-flight capture. Returns `false` if the
    /// session was already cancelled.
    pub fn cancel(&self) -> bool {
        self.0.cancel()
    }
}

/// Measures sample drift by periodically rescanning an anchor region.
///
/// Corrections always compare against the reference captured by
/// [`AnchorDriftCorrector::arm()`], never against the sum of incremental
/// measurements. A tick whose capture fails reports the previous correction
/// again instead of aborting the session.
///
/// Every captured anchor image is kept for export, unless
/// [`DriftConfig::max_anchor_history`] bounds the list. Each entry holds a
/// full anchor frame, so a long session with frequent ticks grows by one
/// frame per tick.
pub struct AnchorDriftCorrector {
    scanner: ScanPair,
    region: AnchorRegion,
    config: DriftConfig,
    status: DriftStatus,
    reference: Option<Mat>,
    previous: Option<Mat>,
    /// pixel size of the reference anchor image
    pixel_size: (f64, f64),
    history: Vec<Image>,
    cumulative: PhysicalShift,
    cumulative_px: ShiftVector,
    incremental: PhysicalShift,
    /// cumulative drift as of the last [`AnchorDriftCorrector::take_unapplied_correction()`]
    polled: PhysicalShift,
    max_drift: f64,
    ticks: usize,
    failed_ticks: usize,
    pixels_per_tick: usize,
    shared: Arc<SharedCancel>,
}

impl AnchorDriftCorrector {
    pub fn new(
        scanner: ScanPair,
        region: AnchorRegion,
        config: DriftConfig,
    ) -> Result<Self, DriftError> {
        config.validate()?;
        Ok(Self {
            scanner,
            region,
            config,
            status: DriftStatus::Idle,
            reference: None,
            previous: None,
            pixel_size: (1.0, 1.0),
            history: Vec::new(),
            cumulative: PhysicalShift::default(),
            cumulative_px: ShiftVector::default(),
            incremental: PhysicalShift::default(),
            polled: PhysicalShift::default(),
            max_drift: 0.0,
            ticks: 0,
            failed_ticks: 0,
            pixels_per_tick: 1,
            shared: Arc::default(),
        })
    }

    pub fn state(&self) -> DriftStatus {
        if self.shared.is_cancelled() {
            DriftStatus::Cancelled
        } else {
            self.status
        }
    }

    pub fn region(&self) -> &AnchorRegion {
        &self.region
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Drift since the reference as of the last successful tick.
    pub fn cumulative_drift(&self) -> PhysicalShift {
        self.cumulative
    }

    /// Drift between the last two successful anchor captures.
    pub fn incremental_drift(&self) -> PhysicalShift {
        self.incremental
    }

    /// Drift measured since the previous call, or since the reference on the
    /// first call. The host adds the negative of it to the offset it already
    /// applies.
    pub fn take_unapplied_correction(&mut self) -> PhysicalShift {
        let unapplied = self.cumulative - self.polled;
        self.polled = self.cumulative;
        unapplied
    }

    /// Largest cumulative drift magnitude seen so far, in meters.
    pub fn max_drift(&self) -> f64 {
        self.max_drift
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn failed_ticks(&self) -> usize {
        self.failed_ticks
    }

    /// Anchor images captured so far, the reference first. With
    /// [`DriftConfig::max_anchor_history`] set only the most recent ones
    /// follow the reference.
    pub fn anchor_history(&self) -> &[Image] {
        &self.history
    }

    pub fn canceller(&self) -> DriftCanceller {
        DriftCanceller(Arc::clone(&self.shared))
    }

    /// Cancels the session and any in-flight capture.
    pub fn cancel(&mut self) -> bool {
        let first = self.shared.cancel();
        self.status = DriftStatus::Cancelled;
        if first {
            info!(
                "drift correction cancelled after {} ticks, cumulative drift {:?}",
                self.ticks, self.cumulative
            );
        }
        first
    }

    fn scan_settings(&self) -> Result<ScanSettings, DriftError> {
        ScanSettings::for_region(
            self.scanner.emitter.as_ref(),
            &self.region.roi,
            self.region.scale,
            self.region.dwell_time,
        )
    }

    /// Time one anchor scan takes.
    pub fn anchor_scan_time(&self) -> Result<Duration, DriftError> {
        Ok(self.scanner.emitter.estimate_scan_time(&self.scan_settings()?))
    }

    /// Extra time the anchor scans add to a host acquisition of `shape`
    /// pixels lasting `acquisition_time`: the reference plus one scan per
    /// correction period.
    pub fn estimate_acquisition_time(
        &self,
        acquisition_time: Duration,
        shape: (usize, usize),
    ) -> Result<Duration, DriftError> {
        let per_tick = self.pixels_per_tick_for(acquisition_time, shape);
        let pixels = (shape.0 * shape.1).max(1);
        let ticks = pixels.div_ceil(per_tick);
        let scan = self.anchor_scan_time()?;
        Ok(scan.saturating_mul((ticks + 1).min(u32::MAX as usize) as u32))
    }

    /// Number of host pixels acquired during one correction period.
    fn pixels_per_tick_for(&self, acquisition_time: Duration, shape: (usize, usize)) -> usize {
        let pixels = (shape.0 * shape.1).max(1);
        let total = acquisition_time.as_secs_f64();
        if total <= 0.0 {
            return pixels;
        }
        ((self.config.period_s * pixels as f64 / total).floor() as usize).clamp(1, pixels)
    }

    fn ensure_active(&self, operation: &str) -> Result<(), DriftError> {
        match self.state() {
            DriftStatus::Cancelled | DriftStatus::Completed => Err(DriftError::InvalidState(
                format!("cannot {operation}: session is {:?}", self.state()),
            )),
            _ => Ok(()),
        }
    }

    /// One anchor capture, registered as the in-flight task so that a
    /// [`DriftCanceller`] can interrupt it.
    fn capture(&self) -> Result<Image, DriftError> {
        let task = acquire_frame(
            &self.scanner,
            self.scan_settings()?,
            self.config.timeout_factor,
            self.config.timeout_margin(),
        )?;
        {
            let mut in_flight = lock(&self.shared.in_flight);
            if self.shared.is_cancelled() {
                drop(in_flight);
                let _ = task.cancel();
                return Err(DriftError::Cancelled);
            }
            *in_flight = Some(task.clone());
        }
        let frame = task.result(None);
        let _ = lock(&self.shared.in_flight).take();
        frame
    }

    /// Captures the session reference of the anchor `roi` scanned with `dwell_time`.
    ///
    /// A failed capture is reported as [`DriftError::AnchorCapture`]: without
    /// a reference there is nothing to correct against.
    pub fn arm(&mut self, roi: Roi, dwell_time: Duration) -> Result<(), DriftError> {
        self.ensure_active("arm")?;
        if self.status != DriftStatus::Idle {
            return Err(DriftError::InvalidState(
                "drift correction is already armed".to_string(),
            ));
        }
        self.region.roi = roi;
        self.region.dwell_time = dwell_time;

        let image = match self.capture() {
            Ok(image) => image,
            Err(DriftError::Cancelled) => {
                self.status = DriftStatus::Cancelled;
                return Err(DriftError::Cancelled);
            }
            Err(e) => {
                error!("failed to capture the anchor reference: {e}");
                return Err(DriftError::AnchorCapture(e.to_string()));
            }
        };
        let grey = image.to_grey_f64()?;
        self.pixel_size = image.pixel_size();
        info!(
            "drift correction armed on {:?}, anchor {:?} px, reference taken at {:?}",
            roi.ltrb(),
            image.shape(),
            image.metadata().acquired_at
        );
        self.previous = Some(grey.clone());
        self.reference = Some(grey);
        self.push_history(image);
        self.status = DriftStatus::Armed;
        Ok(())
    }

    /// Keeps the reference and at most `max_anchor_history - 1` later images.
    fn push_history(&mut self, image: Image) {
        self.history.push(image);
        if let Some(limit) = self.config.max_anchor_history {
            let excess = self.history.len().saturating_sub(limit);
            if excess > 0 {
                let _ = self.history.drain(1..1 + excess);
            }
        }
    }

    fn measurement(&self, stale: bool) -> DriftMeasurement {
        DriftMeasurement {
            tick: self.ticks,
            cumulative: self.cumulative,
            incremental: if stale {
                PhysicalShift::default()
            } else {
                self.incremental
            },
            cumulative_px: self.cumulative_px,
            stale,
        }
    }

    /// Logs a failed tick and reports the previous correction again.
    fn stale_tick(&mut self, reason: &DriftError) -> DriftMeasurement {
        self.failed_ticks += 1;
        self.status = DriftStatus::Tracking;
        warn!(
            "drift correction tick {} failed ({reason}), reusing correction {:?}",
            self.ticks, self.cumulative
        );
        self.measurement(true)
    }

    /// Grey version of `image` and its shifts against the reference and the
    /// previous capture, in pixels.
    fn register_frame(&self, image: &Image) -> Result<(Mat, ShiftVector, ShiftVector), DriftError> {
        let (Some(reference), Some(previous)) = (&self.reference, &self.previous) else {
            return Err(DriftError::InvalidState(
                "armed without a reference".to_string(),
            ));
        };
        let current = image.to_grey_f64()?;
        if current.shape() != reference.shape() {
            return Err(DriftError::InvalidInput(format!(
                "anchor frame is {:?} px, the reference {:?} px",
                current.shape(),
                reference.shape()
            )));
        }
        let precision = self.config.precision;
        let cumulative_px = estimate_shift(reference, &current, precision)?;
        let incremental_px = estimate_shift(previous, &current, precision)?;
        Ok((current, cumulative_px, incremental_px))
    }

    /// Rescans the anchor and measures the drift since the reference.
    ///
    /// A capture that times out, fails, or delivers a frame that cannot be
    /// registered (e.g. a partial scan) is logged and the previous correction
    /// is returned with `stale` set. Only a cancellation or an invalid state
    /// make this return an error.
    pub fn tick(&mut self) -> Result<DriftMeasurement, DriftError> {
        self.ensure_active("tick")?;
        if self.status == DriftStatus::Idle {
            return Err(DriftError::InvalidState(
                "drift correction is not armed".to_string(),
            ));
        }
        if self.reference.is_none() {
            return Err(DriftError::InvalidState(
                "armed without a reference".to_string(),
            ));
        }
        self.ticks += 1;

        let image = match self.capture() {
            Ok(image) => image,
            Err(DriftError::Cancelled) => {
                self.status = DriftStatus::Cancelled;
                return Err(DriftError::Cancelled);
            }
            Err(e) => return Ok(self.stale_tick(&e)),
        };
        let (current, cumulative_px, incremental_px) = match self.register_frame(&image) {
            Ok(registered) => registered,
            Err(e) => return Ok(self.stale_tick(&e)),
        };

        self.cumulative_px = cumulative_px;
        self.cumulative = PhysicalShift::from_pixels(cumulative_px, self.pixel_size);
        self.incremental = PhysicalShift::from_pixels(incremental_px, self.pixel_size);
        self.max_drift = self.max_drift.max(self.cumulative.norm());
        self.previous = Some(current);
        self.push_history(image);
        self.status = DriftStatus::Tracking;
        debug!(
            "tick {}: drift {:?} m ({:?} px), since last {:?} m",
            self.ticks, self.cumulative, self.cumulative_px, self.incremental
        );
        Ok(self.measurement(false))
    }
}

impl Leech for AnchorDriftCorrector {
    fn start(
        &mut self,
        estimated_total_time: Duration,
        shape: (usize, usize),
    ) -> Result<Option<usize>, DriftError> {
        self.ensure_active("start")?;
        self.pixels_per_tick = self.pixels_per_tick_for(estimated_total_time, shape);
        if self.status == DriftStatus::Idle {
            self.arm(self.region.roi, self.region.dwell_time)?;
        }
        debug!(
            "correcting drift every {} pixels of {shape:?}",
            self.pixels_per_tick
        );
        Ok(Some(self.pixels_per_tick))
    }

    fn next(&mut self, _raw_data: &[Image]) -> Result<Option<usize>, DriftError> {
        let _ = self.tick()?;
        Ok(Some(self.pixels_per_tick))
    }

    fn complete(&mut self, _raw_data: &[Image]) -> Result<(), DriftError> {
        self.ensure_active("complete")?;
        self.status = DriftStatus::Completed;
        info!(
            "drift correction completed: {} ticks ({} failed), final drift {:?} m, max {:.3e} m",
            self.ticks, self.failed_ticks, self.cumulative, self.max_drift
        );
        Ok(())
    }
}
