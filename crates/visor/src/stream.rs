use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use visor_capture::{DeviceConfig, DeviceStream, Grab, HwBuffer, check_access};
use visor_codec::StillEncoder;
use visor_codec::blank::Blank;
use visor_core::prelude::{
    BoundedTx, MemSinkServer, RawFrame, RecvOutcome, RingConsumer, RingProducer, SendOutcome,
    StreamTelemetry, bounded, floor_seconds, frame_ring, now_monotonic,
};

use crate::config::StreamTunables;
use crate::motion::MotionStream;
use crate::workers::WorkerPool;

/// Capacity of the image ring between the controller and the HTTP front-end.
const IMAGE_RING_CAPACITY: usize = 4;

/// Message rendered into the blank frame while no signal is present.
const NO_SIGNAL_TEXT: &str = "< NO SIGNAL >";

struct Shared {
    stop: AtomicBool,
    http_has_clients: AtomicBool,
    // Monotonic seconds as f64 bits.
    http_last_request_ts: AtomicU64,
    telemetry: StreamTelemetry,
}

impl Shared {
    fn last_request(&self) -> f64 {
        f64::from_bits(self.http_last_request_ts.load(Ordering::Acquire))
    }

    fn set_last_request(&self, ts: f64) {
        self.http_last_request_ts.store(ts.to_bits(), Ordering::Release);
    }
}

/// External control surface of a running stream: stop flag, client presence
/// and telemetry. Handed to the network front-ends.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    /// Ask the controller to drain and stop.
    pub fn break_loop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Report whether HTTP clients are currently attached.
    pub fn set_http_clients(&self, present: bool) {
        self.shared
            .http_has_clients
            .store(present, Ordering::Release);
    }

    /// Record an HTTP request for the exit-on-idle policy.
    pub fn note_http_request(&self) {
        self.shared.set_last_request(now_monotonic());
    }

    /// Telemetry counters (captured fps, drops).
    pub fn telemetry(&self) -> &StreamTelemetry {
        &self.shared.telemetry
    }
}

/// Assembles a [`Stream`].
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use visor::config::StreamTunables;
/// use visor::stream::StreamBuilder;
/// use visor_capture::DeviceConfig;
/// use visor_codec::jpeg::MozjpegEncoder;
///
/// let (mut stream, handle, _ring) = StreamBuilder::new(
///     StreamTunables::default(),
///     DeviceConfig::default(),
///     Arc::new(MozjpegEncoder::new(80)),
/// )
/// .build();
/// std::thread::spawn(move || stream.run());
/// handle.break_loop();
/// ```
pub struct StreamBuilder {
    tunables: StreamTunables,
    device: DeviceConfig,
    encoder: Arc<dyn StillEncoder>,
    n_workers: usize,
    job_timeout: Duration,
    jpeg_sink: Option<MemSinkServer>,
    raw_sink: Option<MemSinkServer>,
    motion: Option<MotionStream>,
    on_idle_exit: Option<Box<dyn Fn() + Send>>,
}

impl StreamBuilder {
    pub fn new(
        tunables: StreamTunables,
        device: DeviceConfig,
        encoder: Arc<dyn StillEncoder>,
    ) -> Self {
        Self {
            tunables,
            device,
            encoder,
            n_workers: 2,
            job_timeout: Duration::from_millis(100),
            jpeg_sink: None,
            raw_sink: None,
            motion: None,
            on_idle_exit: None,
        }
    }

    /// Number of encode workers.
    pub fn n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers.max(1);
        self
    }

    /// Deadline after which a finished encode is dropped as late.
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Attach the still-image memory sink.
    pub fn jpeg_sink(mut self, sink: MemSinkServer) -> Self {
        self.jpeg_sink = Some(sink);
        self
    }

    /// Attach the raw-frame memory sink.
    pub fn raw_sink(mut self, sink: MemSinkServer) -> Self {
        self.raw_sink = Some(sink);
        self
    }

    /// Attach the motion-video processor.
    pub fn motion(mut self, motion: MotionStream) -> Self {
        self.motion = Some(motion);
        self
    }

    /// Hook invoked (once per expiry) when `exit_on_no_clients` trips.
    pub fn on_idle_exit(mut self, hook: impl Fn() + Send + 'static) -> Self {
        self.on_idle_exit = Some(Box::new(hook));
        self
    }

    pub fn build(mut self) -> (Stream, StreamHandle, RingConsumer) {
        self.device.desired_fps = self.tunables.desired_fps;
        let (ring_tx, ring_rx) = frame_ring(IMAGE_RING_CAPACITY);
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            http_has_clients: AtomicBool::new(false),
            http_last_request_ts: AtomicU64::new(0.0f64.to_bits()),
            telemetry: StreamTelemetry::default(),
        });
        let handle = StreamHandle {
            shared: shared.clone(),
        };
        let stream = Stream {
            cfg: self.tunables,
            dev_cfg: self.device,
            encoder: self.encoder,
            n_workers: self.n_workers,
            job_timeout: self.job_timeout,
            jpeg_sink: self.jpeg_sink,
            raw_sink: self.raw_sink,
            motion: self.motion,
            blank: Blank::new(),
            ring_tx,
            shared,
            on_idle_exit: self.on_idle_exit,
            last_online: false,
            last_as_blank_ts: 0.0,
            last_ring_full_log: 0.0,
        };
        (stream, handle, ring_rx)
    }
}

/// The stream controller: owns the capture device across reinit cycles, the
/// encoder worker pool, the releaser pool and the blank/online exposure
/// policy.
pub struct Stream {
    cfg: StreamTunables,
    dev_cfg: DeviceConfig,
    encoder: Arc<dyn StillEncoder>,
    n_workers: usize,
    job_timeout: Duration,
    jpeg_sink: Option<MemSinkServer>,
    raw_sink: Option<MemSinkServer>,
    motion: Option<MotionStream>,
    blank: Blank,
    ring_tx: RingProducer,
    shared: Arc<Shared>,
    on_idle_exit: Option<Box<dyn Fn() + Send>>,
    last_online: bool,
    last_as_blank_ts: f64,
    last_ring_full_log: f64,
}

impl Stream {
    /// Outer reinit loop: expose the blank, wait for the device node, open
    /// device and encoder pool, run the capture cycle, tear down, repeat.
    pub fn run(&mut self) {
        info!(
            path = %self.dev_cfg.path.display(),
            desired_fps = self.cfg.desired_fps,
            "stream loop starting"
        );
        self.shared.set_last_request(now_monotonic());

        while !self.is_stopped() {
            let Some((dev, mut pool)) = self.init_cycle() else {
                break;
            };
            self.capture_cycle(&dev, &mut pool);
            // Dropping the pool joins the workers; the device closes once
            // the last in-flight buffer reference is gone.
        }
        info!("stream loop finished");
    }

    fn is_stopped(&self) -> bool {
        if self.shared.stop.load(Ordering::Acquire) {
            return true;
        }
        if self.cfg.exit_on_no_clients > 0 {
            let now = now_monotonic();
            let last = self.shared.last_request();
            if self.has_any_clients() {
                self.shared.set_last_request(now);
            } else if last + self.cfg.exit_on_no_clients as f64 < now {
                info!(
                    idle_secs = self.cfg.exit_on_no_clients,
                    "no HTTP or sink clients, requesting process exit"
                );
                if let Some(hook) = &self.on_idle_exit {
                    hook();
                }
                // Reset so the hook does not re-fire every tick.
                self.shared.set_last_request(now);
            }
        }
        false
    }

    fn has_any_clients(&self) -> bool {
        // Sink client flags are heartbeat-based and lag behind reality; the
        // exit-on-idle window absorbs that.
        self.shared.http_has_clients.load(Ordering::Acquire)
            || self.jpeg_sink.as_ref().is_some_and(|s| s.has_clients())
            || self.motion.as_ref().is_some_and(|m| m.has_clients())
    }

    /// Idle throttle: with no consumers, sleep in 100 ms slices up to one
    /// second. Returns true iff the full second elapsed with nobody
    /// attached, which forces a keyframe on the next motion-video packet.
    fn slowdown(&self) -> bool {
        if !self.cfg.slowdown {
            return false;
        }
        let mut count = 0;
        while count < 10 && !self.is_stopped() && !self.has_any_clients() {
            thread::sleep(Duration::from_millis(100));
            count += 1;
        }
        count >= 10
    }

    fn init_cycle(&mut self) -> Option<(Arc<DeviceStream>, WorkerPool)> {
        let mut access_errno = 0;
        while !self.is_stopped() {
            self.blank
                .draw(NO_SIGNAL_TEXT, self.dev_cfg.width, self.dev_cfg.height);
            self.shared.telemetry.set_captured_fps(0);
            self.expose_frame(None);

            if let Some(sink) = self.raw_sink.as_mut()
                && sink.check()
            {
                let mut key_requested = false;
                let _ = sink.put(self.blank.raw().as_view(), &mut key_requested);
            }
            if let Some(motion) = self.motion.as_mut() {
                motion.process(self.blank.raw().as_view(), false);
            }

            match check_access(&self.dev_cfg.path) {
                Err(errno) => {
                    if errno != access_errno {
                        warn!(
                            errno,
                            path = %self.dev_cfg.path.display(),
                            "can't access device, waiting"
                        );
                        access_errno = errno;
                    }
                }
                Ok(()) => {
                    access_errno = 0;
                    self.dev_cfg.dma_export = self.encoder.descriptor().kind.wants_dma()
                        || self.motion.is_some();
                    match DeviceStream::open(&self.dev_cfg) {
                        Ok(dev) => {
                            let pool = WorkerPool::new(
                                self.n_workers,
                                self.encoder.clone(),
                                self.cfg.desired_fps,
                                self.job_timeout,
                            );
                            return Some((dev, pool));
                        }
                        // Recoverable opens clear once the source settles;
                        // the rest need operator attention but never abort
                        // the loop.
                        Err(e) if e.retryable() => {
                            warn!(error = %e, code = e.code(), "device open failed, retrying")
                        }
                        Err(e) => {
                            error!(error = %e, code = e.code(), "device open failed")
                        }
                    }
                    info!(
                        delay_secs = self.cfg.error_delay,
                        "sleeping before next stream init"
                    );
                }
            }
            self.sleep_checked(Duration::from_secs(self.cfg.error_delay.max(1)));
        }
        None
    }

    fn sleep_checked(&self, total: Duration) {
        let deadline = now_monotonic() + total.as_secs_f64();
        while !self.is_stopped() && now_monotonic() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn capture_cycle(&mut self, dev: &Arc<DeviceStream>, pool: &mut WorkerPool) {
        let n_bufs = dev.info().n_bufs as usize;
        let release_mutex = Arc::new(Mutex::new(()));
        let release_stop = Arc::new(AtomicBool::new(false));
        let releasers: Vec<Releaser> = (0..n_bufs)
            .map(|index| {
                Releaser::spawn(
                    index,
                    dev.clone(),
                    release_mutex.clone(),
                    release_stop.clone(),
                )
            })
            .collect();

        let mut grab_after = 0.0f64;
        let mut fluency_passed = 0u64;
        let mut fps_accum = 0u32;
        let mut fps_sec = 0i64;

        info!("capturing");
        while !self.is_stopped() && !release_stop.load(Ordering::Acquire) {
            let mut ready = pool.wait();

            if let Some(job) = ready.job.as_mut()
                && let Some(hw) = job.take_hw()
            {
                send_to_releaser(&releasers, hw);
                if job.failed {
                    self.shared.telemetry.count_dropped_failed();
                } else if job.timely {
                    debug!(
                        latency = now_monotonic() - job.dest.grab_ts,
                        "encoded frame exposed"
                    );
                    self.expose_frame(Some(&job.dest));
                } else {
                    self.shared.telemetry.count_dropped_late();
                    debug!("encoded frame dropped as late");
                }
            }

            let force_key = self.slowdown();
            if self.is_stopped() {
                break;
            }

            let grab = match dev.grab() {
                Ok(grab) => grab,
                Err(e) => {
                    warn!(error = %e, code = e.code(), "grab failed, reopening device");
                    break;
                }
            };
            let hw = match grab {
                Grab::Frame(hw) => hw,
                Grab::Broken => {
                    pool.put_back(ready);
                    continue;
                }
                Grab::Timeout => {
                    warn!("persistent grab timeout, reopening device");
                    break;
                }
            };

            let now = now_monotonic();
            if now < grab_after {
                fluency_passed += 1;
                self.shared.telemetry.count_fluency_passed();
                debug!(
                    passed = fluency_passed,
                    grab_after, "frame passed for fluency"
                );
                send_to_releaser(&releasers, hw);
                pool.put_back(ready);
            } else {
                fluency_passed = 0;

                let now_sec = floor_seconds(now);
                if now_sec != fps_sec {
                    debug!(captured_fps = fps_accum, "a new second has come");
                    self.shared.telemetry.set_captured_fps(fps_accum);
                    fps_accum = 0;
                    fps_sec = now_sec;
                }
                fps_accum += 1;

                let delay = pool.fluency_delay(ready.last_job_secs);
                grab_after = now + delay;
                debug!(delay, grab_after, "fluency pacing");

                if let Some(sink) = self.raw_sink.as_mut()
                    && sink.check()
                {
                    let mut key_requested = false;
                    if let Err(e) = sink.put(hw.view(), &mut key_requested) {
                        warn!(error = %e, code = e.code(), "raw sink put failed");
                    }
                }
                if let Some(motion) = self.motion.as_mut() {
                    motion.process(hw.view(), force_key);
                }

                let mut job = ready.job.take().unwrap_or_default();
                job.reset_with_hw(hw);
                pool.assign(ready, job);
            }
        }

        release_stop.store(true, Ordering::Release);
        for releaser in releasers {
            releaser.join();
        }
    }

    fn expose_frame(&mut self, frame: Option<&RawFrame>) {
        self.expose_frame_at(frame, now_monotonic());
    }

    /// Blank/online policy for the image ring; `now` is injectable so the
    /// timer transitions stay testable.
    fn expose_frame_at(&mut self, frame: Option<&RawFrame>, now: f64) {
        let mut publish_blank = false;
        match frame {
            Some(_) => {
                self.last_as_blank_ts = 0.0;
                debug!("exposed live frame");
            }
            None => {
                if self.last_online {
                    // Leaving online: decide what the viewers keep seeing.
                    if self.cfg.last_as_blank < 0 {
                        publish_blank = true;
                        info!("video frame changed to blank");
                    } else if self.cfg.last_as_blank > 0 {
                        self.last_as_blank_ts = now + self.cfg.last_as_blank as f64;
                        info!(
                            secs = self.cfg.last_as_blank,
                            "froze last live frame before blanking"
                        );
                    } else {
                        info!("froze last live frame forever");
                    }
                } else if self.cfg.last_as_blank < 0 {
                    publish_blank = true;
                }
                if self.cfg.last_as_blank > 0
                    && self.last_as_blank_ts != 0.0
                    && self.last_as_blank_ts < now
                {
                    publish_blank = true;
                    self.last_as_blank_ts = 0.0;
                    info!("changed last live frame to blank");
                }
            }
        }

        if frame.is_some() || publish_blank {
            loop {
                if self.is_stopped() {
                    // Abandon the publish entirely.
                    return;
                }
                if let Some(mut slot) = self.ring_tx.acquire(Duration::from_millis(100)) {
                    match frame {
                        Some(live) => {
                            slot.copy_from(live);
                            slot.online = true;
                        }
                        None => {
                            slot.copy_from(self.blank.jpeg());
                            slot.online = false;
                        }
                    }
                    slot.publish();
                    break;
                }
                let log_now = now_monotonic();
                if log_now - self.last_ring_full_log >= 1.0 {
                    error!("can't push frame to image ring (no free slots)");
                    self.last_ring_full_log = log_now;
                }
            }
        }
        self.last_online = frame.is_some();

        if let Some(sink) = self.jpeg_sink.as_mut()
            && sink.check()
        {
            let mut key_requested = false;
            let view = match frame {
                Some(live) => live.as_view(),
                None => self.blank.jpeg().as_view(),
            };
            if let Err(e) = sink.put(view, &mut key_requested) {
                warn!(error = %e, code = e.code(), "image sink put failed");
            }
        }
    }
}

struct Releaser {
    tx: BoundedTx<HwBuffer>,
    thread: Option<JoinHandle<()>>,
}

impl Releaser {
    /// One thread per hardware-buffer slot with a single-entry queue;
    /// release can block briefly in the kernel, and splitting it off keeps
    /// the controller grabbing.
    fn spawn(
        index: usize,
        dev: Arc<DeviceStream>,
        mutex: Arc<Mutex<()>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = bounded::<HwBuffer>(1);
        let thread = thread::Builder::new()
            .name(format!("release-{index}"))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        RecvOutcome::Data(hw) => {
                            let _guard = mutex.lock();
                            if let Err(e) = dev.release(hw) {
                                error!(error = %e, "buffer release failed");
                                break;
                            }
                        }
                        RecvOutcome::Closed => break,
                        RecvOutcome::Empty => {}
                    }
                }
                // Bring the peers down with us.
                stop.store(true, Ordering::Release);
            })
            .ok();
        Self { tx, thread }
    }

    fn join(mut self) {
        self.tx.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn send_to_releaser(releasers: &[Releaser], hw: HwBuffer) {
    let index = hw.index as usize;
    match releasers.get(index) {
        Some(releaser) => {
            if releaser.tx.send(hw) != SendOutcome::Ok {
                error!(index, "releaser queue rejected a buffer");
            }
        }
        None => error!(index, "no releaser for buffer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use visor_codec::jpeg::MozjpegEncoder;
    use visor_core::prelude::FourCc;

    fn builder(tunables: StreamTunables) -> StreamBuilder {
        StreamBuilder::new(
            tunables,
            DeviceConfig::default(),
            Arc::new(MozjpegEncoder::new(80)),
        )
    }

    fn live_frame() -> RawFrame {
        let mut frame = RawFrame::new();
        frame.set_geometry(4, 4, 12, FourCc::JPEG, 30.0);
        frame.online = true;
        frame.assign(&[9u8; 32]);
        frame
    }

    #[test]
    fn blank_immediately_when_configured() {
        let (mut stream, _handle, mut ring) = builder(StreamTunables {
            last_as_blank: -1,
            ..StreamTunables::default()
        })
        .build();
        stream.blank.draw(NO_SIGNAL_TEXT, 64, 48);

        let live = live_frame();
        stream.expose_frame_at(Some(&live), 10.0);
        {
            let slot = ring.try_acquire().expect("live frame in ring");
            assert!(slot.online);
            assert_eq!(slot.payload(), live.payload());
        }

        stream.expose_frame_at(None, 11.0);
        let slot = ring.try_acquire().expect("blank in ring");
        assert!(!slot.online);
        assert_eq!(&slot.payload()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn freeze_forever_never_blanks() {
        let (mut stream, _handle, mut ring) = builder(StreamTunables {
            last_as_blank: 0,
            ..StreamTunables::default()
        })
        .build();
        stream.blank.draw(NO_SIGNAL_TEXT, 64, 48);

        let live = live_frame();
        stream.expose_frame_at(Some(&live), 10.0);
        drop(ring.try_acquire().expect("live frame"));

        stream.expose_frame_at(None, 11.0);
        stream.expose_frame_at(None, 1_000.0);
        assert!(ring.try_acquire().is_none(), "frozen frame is kept");
    }

    #[test]
    fn freeze_with_timer_blanks_after_expiry() {
        let (mut stream, _handle, mut ring) = builder(StreamTunables {
            last_as_blank: 5,
            ..StreamTunables::default()
        })
        .build();
        stream.blank.draw(NO_SIGNAL_TEXT, 64, 48);

        let live = live_frame();
        stream.expose_frame_at(Some(&live), 100.0);
        drop(ring.try_acquire().expect("live frame"));

        // Signal lost at t=101: timer armed, last frame kept.
        stream.expose_frame_at(None, 101.0);
        assert!(ring.try_acquire().is_none());
        // Still inside the freeze window.
        stream.expose_frame_at(None, 104.0);
        assert!(ring.try_acquire().is_none());
        // Window expired: the blank goes out, offline.
        stream.expose_frame_at(None, 106.5);
        let slot = ring.try_acquire().expect("blank after expiry");
        assert!(!slot.online);
    }

    #[test]
    fn idle_exit_fires_once_and_resets() {
        let fired = Arc::new(AtomicU32::new(0));
        let hook_fired = fired.clone();
        let (stream, _handle, _ring) = builder(StreamTunables {
            exit_on_no_clients: 30,
            ..StreamTunables::default()
        })
        .on_idle_exit(move || {
            hook_fired.fetch_add(1, Ordering::Relaxed);
        })
        .build();

        stream.shared.set_last_request(now_monotonic() - 31.0);
        assert!(!stream.is_stopped());
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // Timestamp was reset; no re-fire.
        assert!(!stream.is_stopped());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn slowdown_lifts_after_a_second_without_clients() {
        let (stream, handle, _ring) = builder(StreamTunables {
            slowdown: true,
            ..StreamTunables::default()
        })
        .build();

        let start = now_monotonic();
        assert!(stream.slowdown(), "no clients for a full second");
        assert!(now_monotonic() - start >= 0.9);

        handle.set_http_clients(true);
        assert!(!stream.slowdown(), "client present, no throttle");
    }

    #[test]
    fn break_loop_stops_the_stream() {
        let (stream, handle, _ring) = builder(StreamTunables::default()).build();
        assert!(!stream.is_stopped());
        handle.break_loop();
        assert!(stream.is_stopped());
    }
}
