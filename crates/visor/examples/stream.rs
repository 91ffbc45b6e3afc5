//! Capture from /dev/video0 and serve JPEG frames through a memory sink.
//!
//! Front-ends attach to the `visor-jpeg` shared-memory segment; run with
//! `RUST_LOG=debug` for the per-frame chatter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use visor::config::StreamTunables;
use visor::stream::StreamBuilder;
use visor_capture::DeviceConfig;
use visor_codec::jpeg::MozjpegEncoder;
use visor_core::prelude::{MemSinkServer, SinkConfig};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let tunables = StreamTunables {
        desired_fps: 30,
        slowdown: true,
        ..StreamTunables::default()
    };
    let sink = match MemSinkServer::open(&SinkConfig::new("visor-jpeg", 4 << 20)) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("can't create jpeg sink: {e}");
            return;
        }
    };

    let (mut stream, handle, mut ring) = StreamBuilder::new(
        tunables,
        DeviceConfig::default(),
        Arc::new(MozjpegEncoder::new(80)),
    )
    .n_workers(2)
    .jpeg_sink(sink)
    .build();

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }

    let worker = std::thread::spawn(move || stream.run());

    // Play the HTTP front-end: drain the image ring and report throughput.
    let mut frames = 0u32;
    let mut last_report = std::time::Instant::now();
    while !INTERRUPTED.load(Ordering::Acquire) {
        if let Some(frame) = ring.acquire(Duration::from_millis(250)) {
            if frame.online {
                frames += 1;
            }
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            println!("{} live frames in the last 5s", frames);
            frames = 0;
            last_report = std::time::Instant::now();
        }
    }
    handle.break_loop();
    let _ = worker.join();
}
