//! Example callback consumer
//!
//! Attaches to a blocking frame buffer and hands every newly published frame
//! to a callback, stopping after a fixed number of deliveries.
//!
//! Usage: callback_consumer [namespace] [max_frames]

use frameshm::ProducerConsumer;
use std::ops::ControlFlow;

fn main() {
    let mut args = std::env::args().skip(1);
    let namespace = args.next().unwrap_or_else(|| "frames_4k".to_string());
    let max_frames: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(50);

    println!("[Callback] namespace: {namespace}, stopping after {max_frames} frames");

    let consumer = match ProducerConsumer::attach(&namespace) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("[Callback] failed to attach: {e}");
            std::process::exit(1);
        }
    };

    let mut delivered = 0u64;
    let result = consumer.consume_with_callback(|frame| {
        delivered += 1;
        // Cheap content probe: first pixel of the frame
        println!(
            "[Callback] delivery {}: frame {} (pixel[0] = {})",
            delivered,
            frame.frame_number,
            frame.pixels()[0]
        );
        if delivered >= max_frames {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    match result {
        Ok(()) => println!("[Callback] done, {delivered} frames delivered"),
        Err(e) => {
            eprintln!("[Callback] consumption failed: {e}");
            std::process::exit(1);
        }
    }
}
