// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use libdrift::prelude::*;
use libdrift::simulated::{SimulatedScanner, random_blobs};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs a simulated 20 s acquisition of the field centre on a stage drifting
/// about 0.4 um/s, with anchor drift correction every 2 s.
/// `RUST_LOG=debug cargo run --example drift_demo` shows every tick.
fn main() -> Result<(), DriftError> {
    env_logger::Builder::from_default_env()
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let blobs = random_blobs(42, 400, (0.0, 0.0), 95e-6, 2e-6);
    let scanner = Arc::new(SimulatedScanner::new((200, 200), (1e-6, 1e-6), blobs));
    let scan_pair = scanner.scan_pair();
    let config = DriftConfig {
        period_s: 2.0,
        ..Default::default()
    };

    let host_roi = Roi::new(0.3, 0.3, 0.7, 0.7)?;
    let dwell_time = Duration::from_nanos(200);
    let now = Instant::now();
    let Some(anchor_roi) = guess_anchor_region(&scan_pair, &host_roi, dwell_time, &config)? else {
        println!("No anchor region found outside {:?}", host_roi.ltrb());
        return Ok(());
    };
    println!(
        "Guessed anchor {:?} in {:?}",
        anchor_roi.ltrb(),
        now.elapsed()
    );

    let mut corrector = AnchorDriftCorrector::new(
        scan_pair,
        AnchorRegion::new(anchor_roi, dwell_time),
        config,
    )?;
    let host_shape = (400, 500);
    let host_time = Duration::from_secs(20);
    println!(
        "Anchor scans add {:?} to the acquisition",
        corrector.estimate_acquisition_time(host_time, host_shape)?
    );

    let total = host_shape.0 * host_shape.1;
    let mut every = corrector.start(host_time, host_shape)?;
    let mut acquired = 0;
    while let Some(n) = every {
        acquired += n;
        if acquired >= total {
            break;
        }
        // time passes on the stage while the host scans n pixels
        let seconds = host_time.as_secs_f64() * n as f64 / total as f64;
        scanner.add_drift(PhysicalShift::new(0.4e-6 * seconds, -0.15e-6 * seconds));

        every = corrector.next(&[])?;
        let truth = scanner.drift();
        let measured = corrector.cumulative_drift();
        println!(
            "tick {:>2}: measured ({:>6.3}, {:>6.3}) um, true ({:>6.3}, {:>6.3}) um",
            corrector.ticks(),
            measured.x * 1e6,
            measured.y * 1e6,
            truth.x * 1e6,
            truth.y * 1e6,
        );
    }
    corrector.complete(&[])?;
    println!(
        "{} ticks, {} failed, max drift {:.3} um, {} anchor images",
        corrector.ticks(),
        corrector.failed_ticks(),
        corrector.max_drift() * 1e6,
        corrector.anchor_history().len()
    );
    Ok(())
}
