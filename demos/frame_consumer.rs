//! Example consumer
//!
//! Attaches to a frame buffer segment and polls for new frames, reporting
//! producer-to-consumer latency computed from the frame timestamps.
//!
//! Usage: frame_consumer [namespace] [atomic|blocking]

use frameshm::{AtomicProducerConsumer, Frame, FrameShmError, ProducerConsumer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as i64
}

fn report(frame: &Frame) {
    let latency_us = (now_ns() - frame.timestamp) as f64 / 1000.0;
    println!(
        "[Consumer] frame {} ({}x{}x{}), latency {:.1} us",
        frame.frame_number,
        frame.width(),
        frame.height(),
        frame.channels(),
        latency_us
    );
}

fn main() {
    let mut args = std::env::args().skip(1);
    let namespace = args.next().unwrap_or_else(|| "frames_4k".to_string());
    let mode = args.next().unwrap_or_else(|| "atomic".to_string());

    println!("[Consumer] namespace: {namespace}, mode: {mode}");

    match mode.as_str() {
        "atomic" => {
            let handle = match AtomicProducerConsumer::attach(&namespace) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("[Consumer] failed to attach: {e}");
                    std::process::exit(1);
                }
            };
            let mut last_seen: Option<u64> = None;
            loop {
                match handle.load() {
                    Ok(frame) => {
                        if last_seen != Some(frame.frame_number) {
                            last_seen = Some(frame.frame_number);
                            report(&frame);
                        } else {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                    Err(FrameShmError::NotReady) => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        eprintln!("[Consumer] load failed: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        "blocking" => {
            let handle = match ProducerConsumer::attach(&namespace) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("[Consumer] failed to attach: {e}");
                    std::process::exit(1);
                }
            };
            loop {
                match handle.load_timeout(Duration::from_secs(1)) {
                    Ok(frame) => report(&frame),
                    Err(FrameShmError::NotReady) => {
                        println!("[Consumer] waiting for the first frame...");
                    }
                    Err(e) => {
                        eprintln!("[Consumer] load failed: {e}");
                        std::process::exit(1);
                    }
                }
            }
        }
        other => {
            eprintln!("[Consumer] unknown mode '{other}', expected atomic|blocking");
            std::process::exit(2);
        }
    }
}
