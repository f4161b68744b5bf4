// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Boundary to the instrument: a scanning [`Emitter`] decides what is imaged,
//! a push-style [`Detector`] delivers the frames. [`acquire_frame()`] wraps one
//! such capture into a [`CancellableTask`].

use crate::DriftError;
use crate::anchor::Roi;
use crate::image::Image;
use crate::task::{CancelToken, CancellableTask};
use crate::utils::lock;
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Receives frames from a [`Detector`].
pub trait DataListener: Send + Sync {
    fn on_data(&self, image: Image);
}

/// A detector pushes frames to its subscribers for as long as they stay subscribed.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn subscribe(&self, listener: Arc<dyn DataListener>) -> Result<(), DriftError>;

    /// Removing a listener that is not subscribed is a no-op.
    fn unsubscribe(&self, listener: &Arc<dyn DataListener>);
}

/// A scanning source (e.g. an electron beam) with a configurable scan area.
pub trait Emitter: Send + Sync {
    /// `(rows, cols)` of the full field at scale 1.
    fn field_shape(&self) -> (usize, usize);

    /// `(x, y)` pixel size in meters at scale 1.
    fn base_pixel_size(&self) -> (f64, f64);

    fn configure(&self, scan: &ScanSettings) -> Result<(), DriftError>;

    fn estimate_scan_time(&self, scan: &ScanSettings) -> Duration {
        scan.dwell_time
            .saturating_mul(scan.pixel_count().min(u32::MAX as usize) as u32)
    }
}

/// What to scan: a `resolution` sized grid of pixels, each `scale` full-field
/// pixels wide, centred `translation` full-field pixels `(col, row)` away from
/// the field centre.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// `(rows, cols)`
    pub resolution: (usize, usize),
    pub scale: f64,
    /// `(col, row)` offset from the field centre, in full-field pixels
    pub translation: (f64, f64),
    pub dwell_time: Duration,
}

impl ScanSettings {
    pub fn full_field(emitter: &dyn Emitter, dwell_time: Duration) -> Self {
        Self {
            resolution: emitter.field_shape(),
            scale: 1.0,
            translation: (0.0, 0.0),
            dwell_time,
        }
    }

    /// Scan settings covering `roi` (fractions of the full field) at `scale`.
    pub fn for_region(
        emitter: &dyn Emitter,
        roi: &Roi,
        scale: f64,
        dwell_time: Duration,
    ) -> Result<Self, DriftError> {
        if !(scale > 0.0 && scale.is_finite()) {
            return Err(DriftError::InvalidParams(format!(
                "scan scale must be positive, got {scale}"
            )));
        }
        let (rows, cols) = emitter.field_shape();
        let (l, t, r, b) = roi.ltrb();
        let res_rows = (((b - t) * rows as f64) / scale).round().max(1.0) as usize;
        let res_cols = (((r - l) * cols as f64) / scale).round().max(1.0) as usize;
        Ok(Self {
            resolution: (res_rows, res_cols),
            scale,
            translation: (
                ((l + r) / 2.0 - 0.5) * cols as f64,
                ((t + b) / 2.0 - 0.5) * rows as f64,
            ),
            dwell_time,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.resolution.0 * self.resolution.1
    }

    /// Pixel size of the resulting image, `(x, y)` in meters.
    pub fn pixel_size(&self, emitter: &dyn Emitter) -> (f64, f64) {
        let (px, py) = emitter.base_pixel_size();
        (px * self.scale, py * self.scale)
    }
}

/// The emitter/detector couple used for one kind of acquisition.
#[derive(Clone)]
pub struct ScanPair {
    pub emitter: Arc<dyn Emitter>,
    pub detector: Arc<dyn Detector>,
}

impl ScanPair {
    pub fn new(emitter: Arc<dyn Emitter>, detector: Arc<dyn Detector>) -> Self {
        Self { emitter, detector }
    }
}

/// Keeps the first frame it receives.
#[derive(Default)]
struct FrameGrabber {
    frame: Mutex<Option<Image>>,
    arrived: Condvar,
    /// `true` once the capture was cancelled; held while (un)subscribing
    subscription: Mutex<bool>,
}

impl DataListener for FrameGrabber {
    fn on_data(&self, image: Image) {
        let mut frame = lock(&self.frame);
        if frame.is_none() {
            *frame = Some(image);
            self.arrived.notify_all();
        }
    }
}

impl FrameGrabber {
    fn wait(&self, timeout: Duration, token: &CancelToken) -> Result<Image, DriftError> {
        let deadline = Instant::now() + timeout;
        let mut frame = lock(&self.frame);
        loop {
            if let Some(image) = frame.take() {
                return Ok(image);
            }
            if token.is_cancelled() {
                return Err(DriftError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriftError::Timeout(timeout));
            }
            // bounded wait, the cancel path notifies without holding `frame`
            let step = (deadline - now).min(Duration::from_millis(50));
            frame = self
                .arrived
                .wait_timeout(frame, step)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

/// Captures one frame of `scan` as a cancellable task.
///
/// The worker configures the emitter, subscribes a one-shot listener to the
/// detector and waits for the first frame, at most
/// `timeout_factor * estimated_scan_time + timeout_margin`. The subscription is
/// always torn down before the task completes, and cancelling the task tears
/// it down before `cancel()` returns.
pub fn acquire_frame(
    scanner: &ScanPair,
    scan: ScanSettings,
    timeout_factor: f64,
    timeout_margin: Duration,
) -> Result<CancellableTask<Image>, DriftError> {
    let estimate = scanner.emitter.estimate_scan_time(&scan);
    let timeout = estimate.mul_f64(timeout_factor.max(1.0)) + timeout_margin;
    let task = CancellableTask::new();
    let now = Instant::now();
    task.set_progress(now, now + estimate);

    let grabber = Arc::new(FrameGrabber::default());
    let listener: Arc<dyn DataListener> = grabber.clone();
    {
        let grabber = Arc::clone(&grabber);
        let listener = Arc::clone(&listener);
        let detector = Arc::clone(&scanner.detector);
        task.set_canceller(move || {
            let mut cancelled = lock(&grabber.subscription);
            *cancelled = true;
            detector.unsubscribe(&listener);
            grabber.arrived.notify_all();
        });
    }

    let emitter = Arc::clone(&scanner.emitter);
    let detector = Arc::clone(&scanner.detector);
    task.submit("frame-acquisition", move |token| {
        emitter.configure(&scan)?;
        {
            let cancelled = lock(&grabber.subscription);
            if *cancelled || token.is_cancelled() {
                return Err(DriftError::Cancelled);
            }
            detector.subscribe(Arc::clone(&listener))?;
        }
        debug!(
            "acquiring {:?} from {}, timeout {timeout:?}",
            scan.resolution,
            detector.name()
        );
        let frame = grabber.wait(timeout, &token);
        {
            let _guard = lock(&grabber.subscription);
            detector.unsubscribe(&listener);
        }
        if let Err(DriftError::Timeout(t)) = &frame {
            warn!("no frame from {} within {t:?}", detector.name());
        }
        frame
    })?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Metadata;
    use crate::task::TaskState;
    use crate::utils::mat_from_fn;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Emitter/detector that answers each subscription from a helper thread,
    /// unless `silent`.
    struct Loopback {
        listeners: Mutex<Vec<Arc<dyn DataListener>>>,
        silent: AtomicBool,
        last_scan: Mutex<Option<ScanSettings>>,
    }

    impl Loopback {
        fn new(silent: bool) -> Arc<Self> {
            Arc::new(Self {
                listeners: Mutex::new(Vec::new()),
                silent: AtomicBool::new(silent),
                last_scan: Mutex::new(None),
            })
        }

        fn subscribers(&self) -> usize {
            lock(&self.listeners).len()
        }
    }

    impl Emitter for Loopback {
        fn field_shape(&self) -> (usize, usize) {
            (100, 200)
        }
        fn base_pixel_size(&self) -> (f64, f64) {
            (1e-6, 1e-6)
        }
        fn configure(&self, scan: &ScanSettings) -> Result<(), DriftError> {
            *lock(&self.last_scan) = Some(scan.clone());
            Ok(())
        }
    }

    impl Detector for Loopback {
        fn name(&self) -> &str {
            "loopback"
        }
        fn subscribe(&self, listener: Arc<dyn DataListener>) -> Result<(), DriftError> {
            lock(&self.listeners).push(Arc::clone(&listener));
            if !self.silent.load(Ordering::SeqCst) {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    let data = mat_from_fn(4, 4, |r, c| (r + c) as f64).unwrap();
                    listener.on_data(Image::new(data, Metadata::default()).unwrap());
                });
            }
            Ok(())
        }
        fn unsubscribe(&self, listener: &Arc<dyn DataListener>) {
            lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    fn pair(hw: &Arc<Loopback>) -> ScanPair {
        ScanPair::new(hw.clone(), hw.clone())
    }

    fn small_scan() -> ScanSettings {
        ScanSettings {
            resolution: (4, 4),
            scale: 1.0,
            translation: (0.0, 0.0),
            dwell_time: Duration::from_micros(10),
        }
    }

    #[test]
    fn region_geometry() {
        let hw = Loopback::new(false);
        let roi = Roi::new(0.5, 0.25, 0.75, 0.5).unwrap();
        let scan = ScanSettings::for_region(hw.as_ref(), &roi, 2.0, Duration::from_micros(1))
            .unwrap();
        assert_eq!((13, 25), scan.resolution);
        assert_eq!((25.0, -12.5), scan.translation);
        assert_eq!((2e-6, 2e-6), scan.pixel_size(hw.as_ref()));
        assert!(ScanSettings::for_region(hw.as_ref(), &roi, 0.0, Duration::ZERO).is_err());
        let full = ScanSettings::full_field(hw.as_ref(), Duration::from_micros(2));
        assert_eq!(Duration::from_micros(2 * 100 * 200), hw.estimate_scan_time(&full));
    }

    #[test]
    fn acquires_one_frame_and_unsubscribes() {
        let hw = Loopback::new(false);
        let task = acquire_frame(&pair(&hw), small_scan(), 10.0, Duration::from_secs(2)).unwrap();
        let image = task.result(Some(Duration::from_secs(5))).unwrap();
        assert_eq!((4, 4), image.shape());
        assert_eq!(0, hw.subscribers());
        assert_eq!(Some(small_scan()), lock(&hw.last_scan).clone());
    }

    #[test]
    fn stalled_detector_times_out() {
        let hw = Loopback::new(true);
        let start = Instant::now();
        let task =
            acquire_frame(&pair(&hw), small_scan(), 10.0, Duration::from_millis(150)).unwrap();
        assert!(matches!(task.result(None), Err(DriftError::Timeout(_))));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(140), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(TaskState::Failed, task.state());
        assert_eq!(0, hw.subscribers());
    }

    #[test]
    fn caller_side_timeout_is_bounded() {
        let hw = Loopback::new(true);
        let task = acquire_frame(&pair(&hw), small_scan(), 10.0, Duration::from_secs(30)).unwrap();
        let start = Instant::now();
        let r = task.result(Some(Duration::from_millis(200)));
        let elapsed = start.elapsed();
        assert!(matches!(r, Err(DriftError::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
        assert!(task.cancel());
    }

    #[test]
    fn cancel_tears_down_subscription() {
        let hw = Loopback::new(true);
        let task = acquire_frame(&pair(&hw), small_scan(), 10.0, Duration::from_secs(30)).unwrap();
        // let the worker subscribe
        let start = Instant::now();
        while hw.subscribers() == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(1, hw.subscribers());
        assert!(task.cancel());
        assert_eq!(0, hw.subscribers());
        assert!(!task.cancel());
        assert!(matches!(task.result(None), Err(DriftError::Cancelled)));
    }
}
