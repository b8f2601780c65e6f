//! Example producer
//!
//! Creates a frame buffer segment and publishes 4K RGB frames as fast as it
//! can, reporting per-store latency.
//!
//! Usage: frame_producer [namespace] [atomic|blocking] [frame_count]

use frameshm::{AtomicProducerConsumer, Frame, ProducerConsumer};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos() as i64
}

fn main() {
    let mut args = std::env::args().skip(1);
    let namespace = args.next().unwrap_or_else(|| "frames_4k".to_string());
    let mode = args.next().unwrap_or_else(|| "atomic".to_string());
    let frame_count: u64 = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    println!("[Producer] namespace: {namespace}, mode: {mode}, frames: {frame_count}");

    let mut frame = Frame::new();
    // Recognizable payload: every frame is a solid gray level
    let store: Box<dyn Fn(&Frame) -> frameshm::Result<()>> = match mode.as_str() {
        "atomic" => {
            let handle = match AtomicProducerConsumer::open_or_create(&namespace) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("[Producer] failed to open segment: {e}");
                    std::process::exit(1);
                }
            };
            Box::new(move |f| handle.store(f))
        }
        "blocking" => {
            let handle = match ProducerConsumer::open_or_create(&namespace) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("[Producer] failed to open segment: {e}");
                    std::process::exit(1);
                }
            };
            Box::new(move |f| handle.store(f))
        }
        other => {
            eprintln!("[Producer] unknown mode '{other}', expected atomic|blocking");
            std::process::exit(2);
        }
    };

    let mut total_ns = 0u128;
    let mut max_ns = 0u128;
    for n in 0..frame_count {
        frame.frame_number = n;
        frame.timestamp = now_ns();
        let level = (n % 256) as u8;
        frame.pixels_mut().fill(level);

        let start = Instant::now();
        if let Err(e) = store(&frame) {
            eprintln!("[Producer] store failed: {e}");
            std::process::exit(1);
        }
        let elapsed = start.elapsed().as_nanos();
        total_ns += elapsed;
        max_ns = max_ns.max(elapsed);
    }

    println!(
        "[Producer] published {} frames, avg store {:.1} us, max {:.1} us",
        frame_count,
        total_ns as f64 / frame_count as f64 / 1000.0,
        max_ns as f64 / 1000.0
    );
    println!("[Producer] segment '{namespace}' left in place; consumers may still attach");
}
