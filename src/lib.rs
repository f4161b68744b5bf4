// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library contains drift correction, sub-pixel image registration and
//! tile stitching functions, based on OpenCV <https://crates.io/crates/opencv>
//! and Rayon <https://crates.io/crates/rayon>.
//!
//! The central piece is [`shift::estimate_shift()`], a phase correlation shift
//! estimator with optional upsampled-DFT refinement:
//! Manuel Guizar-Sicairos, Samuel T. Thurman, and James R. Fienup,
//! "Efficient subpixel image registration algorithms," Opt. Lett. 33, 156-158 (2008).
//!
//! Around it sit:
//! * [`task::CancellableTask`], a thread backed future with a single terminal outcome,
//! * [`hardware::acquire_frame()`], which turns a push-style detector into such a task,
//! * [`drift::AnchorDriftCorrector`], which keeps a long scan spatially stable by
//!   re-imaging a small anchor region and comparing it against the first capture,
//! * [`stitching`], which registers and weaves tiles into a single image.

pub mod anchor;
pub mod config;
pub mod drift;
pub mod hardware;
pub mod image;
pub mod shift;
pub mod simulated;
pub mod stitching;
pub mod task;
pub mod utils;

pub use opencv;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DriftError {
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error("Invalid input {0}")]
    InvalidInput(String),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("Anchor capture failed: {0}")]
    AnchorCapture(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Cancelled")]
    Cancelled,
    #[error("Invalid state {0}")]
    InvalidState(String),
    #[error("Hardware error {0}")]
    Hardware(String),
    #[error("Internal error {0}")]
    ProcessingError(String),
}

pub mod prelude {
    pub use super::{
        DriftError,
        anchor::{AnchorRegion, Roi, guess_anchor_region, select_anchor},
        config::{DriftConfig, StitchConfig},
        drift::{AnchorDriftCorrector, DriftCanceller, DriftMeasurement, DriftStatus, Leech},
        hardware::{DataListener, Detector, Emitter, ScanPair, ScanSettings, acquire_frame},
        image::{Image, Metadata},
        shift::{PhysicalShift, ShiftVector, estimate_shift},
        stitching::{RegistrationMethod, Tile, WeavingMethod, register, weave},
        task::{CancelToken, CancellableTask, TaskState},
    };
}
