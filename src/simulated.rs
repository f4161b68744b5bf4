// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! A software scanning microscope: gaussian features on a drifting stage.
//!
//! [`SimulatedScanner`] implements both [`Emitter`] and [`Detector`]. Frames are
//! rendered when a listener subscribes and delivered from a helper thread, so
//! the acquisition path is exercised exactly as with real hardware. Individual
//! captures can be made to stall or to carry noise.

use crate::DriftError;
use crate::hardware::{DataListener, Detector, Emitter, ScanPair, ScanSettings};
use crate::image::{Image, Metadata};
use crate::shift::PhysicalShift;
use crate::utils::{lock, mat_from_fn};
use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

/// A gaussian feature of the sample, positions in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub x: f64,
    pub y: f64,
    pub sigma: f64,
    pub amplitude: f64,
}

/// `count` blobs uniformly spread over a square of `half_extent` around `centre`.
pub fn random_blobs(
    seed: u64,
    count: usize,
    centre: (f64, f64),
    half_extent: f64,
    sigma: f64,
) -> Vec<Blob> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| Blob {
            x: centre.0 + rng.gen_range(-half_extent..=half_extent),
            y: centre.1 + rng.gen_range(-half_extent..=half_extent),
            sigma,
            amplitude: rng.gen_range(50.0..=250.0),
        })
        .collect()
}

pub struct SimulatedScanner {
    field_shape: (usize, usize),
    pixel_size: (f64, f64),
    blobs: Vec<Blob>,
    latency: Duration,
    seed: u64,
    drift: Mutex<PhysicalShift>,
    scan: Mutex<Option<ScanSettings>>,
    listeners: Mutex<Vec<Arc<dyn DataListener>>>,
    captures: AtomicUsize,
    stalled: Mutex<HashSet<usize>>,
    noisy: Mutex<HashMap<usize, f64>>,
    truncated: Mutex<HashMap<usize, usize>>,
}

impl SimulatedScanner {
    /// A `(rows, cols)` field of `pixel_size` `(x, y)` meter pixels, centred on
    /// the physical origin.
    pub fn new(field_shape: (usize, usize), pixel_size: (f64, f64), blobs: Vec<Blob>) -> Self {
        Self {
            field_shape,
            pixel_size,
            blobs,
            latency: Duration::from_millis(1),
            seed: 0x5eed,
            drift: Mutex::new(PhysicalShift::default()),
            scan: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
            stalled: Mutex::new(HashSet::new()),
            noisy: Mutex::new(HashMap::new()),
            truncated: Mutex::new(HashMap::new()),
        }
    }

    /// Delay between a subscription and the delivery of its frame.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn scan_pair(self: &Arc<Self>) -> ScanPair {
        ScanPair::new(self.clone(), self.clone())
    }

    pub fn drift(&self) -> PhysicalShift {
        *lock(&self.drift)
    }

    pub fn set_drift(&self, drift: PhysicalShift) {
        *lock(&self.drift) = drift;
    }

    /// Moves the stage by `delta`.
    pub fn add_drift(&self, delta: PhysicalShift) {
        let mut drift = lock(&self.drift);
        *drift = *drift + delta;
    }

    /// The capture with this zero based index never delivers a frame.
    pub fn stall_capture(&self, index: usize) {
        let _ = lock(&self.stalled).insert(index);
    }

    /// Adds uniform noise of `amplitude` to the capture with this index.
    pub fn add_noise_to_capture(&self, index: usize, amplitude: f64) {
        let _ = lock(&self.noisy).insert(index, amplitude);
    }

    /// The capture with this index is a partial scan: only its first `rows`
    /// rows are delivered.
    pub fn truncate_capture(&self, index: usize, rows: usize) {
        let _ = lock(&self.truncated).insert(index, rows);
    }

    /// Number of subscriptions seen so far.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn render(&self, scan: &ScanSettings, index: usize) -> Result<Image, DriftError> {
        let (rows, cols) = scan.resolution;
        let (bx, by) = self.pixel_size;
        let (tx, ty) = scan.translation;
        let drift = self.drift();
        let noise = lock(&self.noisy).get(&index).copied();
        let mut rng = StdRng::seed_from_u64(self.seed ^ index as u64);
        let delivered = lock(&self.truncated)
            .get(&index)
            .map_or(rows, |&r| r.clamp(1, rows));

        let data = mat_from_fn(delivered, cols, |r, c| {
            // beam position, then the sample point under it
            let x = (tx + (c as f64 - (cols as f64 - 1.0) / 2.0) * scan.scale) * bx - drift.x;
            let y = -(ty + (r as f64 - (rows as f64 - 1.0) / 2.0) * scan.scale) * by - drift.y;
            let mut v: f64 = self
                .blobs
                .iter()
                .map(|b| {
                    let d2 = (x - b.x).powi(2) + (y - b.y).powi(2);
                    b.amplitude * (-d2 / (2.0 * b.sigma * b.sigma)).exp()
                })
                .sum();
            if let Some(a) = noise {
                v += rng.gen_range(-a..=a);
            }
            v
        })?;
        let metadata = Metadata {
            pixel_size: scan.pixel_size(self),
            position: (tx * bx, -ty * by),
            acquired_at: Some(SystemTime::now()),
            dwell_time: Some(scan.dwell_time),
            exposure_time: None,
        };
        Image::new(data, metadata)
    }
}

impl Emitter for SimulatedScanner {
    fn field_shape(&self) -> (usize, usize) {
        self.field_shape
    }

    fn base_pixel_size(&self) -> (f64, f64) {
        self.pixel_size
    }

    fn configure(&self, scan: &ScanSettings) -> Result<(), DriftError> {
        *lock(&self.scan) = Some(scan.clone());
        Ok(())
    }
}

impl Detector for SimulatedScanner {
    fn name(&self) -> &str {
        "simulated"
    }

    fn subscribe(&self, listener: Arc<dyn DataListener>) -> Result<(), DriftError> {
        let scan = lock(&self.scan).clone().ok_or_else(|| {
            DriftError::Hardware("subscribed before the emitter was configured".to_string())
        })?;
        let index = self.captures.fetch_add(1, Ordering::SeqCst);
        if lock(&self.stalled).contains(&index) {
            trace!("capture {index} stalls");
            lock(&self.listeners).push(listener);
            return Ok(());
        }
        let image = self.render(&scan, index)?;
        lock(&self.listeners).push(Arc::clone(&listener));
        let latency = self.latency;
        thread::Builder::new()
            .name("simulated-detector".to_string())
            .spawn(move || {
                thread::sleep(latency);
                listener.on_data(image);
            })
            .map_err(|e| DriftError::Hardware(e.to_string()))?;
        Ok(())
    }

    fn unsubscribe(&self, listener: &Arc<dyn DataListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }
}
