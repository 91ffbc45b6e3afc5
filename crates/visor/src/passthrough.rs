use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use visor_capture::{DeviceConfig, DeviceStream, Grab, check_access};
use visor_core::prelude::FourCc;
use visor_display::DisplayConfig;
use visor_display::mirror::{DisplayError, DrmMirror, StubReason};

/// Pacing for stub screens; flips are still vsync-bound, this just avoids
/// redrawing captions at capture rate.
const STUB_TICK: Duration = Duration::from_millis(500);

/// The display-mirror driver: a v4p-style loop that grabs frames from its
/// own capture session and page-flips them to the local display, or paints
/// reason stubs when live scanout is impossible (no device, bad
/// format/resolution, capture busy with the streamer).
///
/// Owns the mirror exclusively; the display runtime has no other callers.
pub struct Passthrough {
    dev_cfg: DeviceConfig,
    mirror: DrmMirror,
    error_delay: Duration,
    stop: Arc<AtomicBool>,
}

/// Stop control for a running passthrough loop.
#[derive(Clone)]
pub struct PassthroughHandle {
    stop: Arc<AtomicBool>,
}

impl PassthroughHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Passthrough {
    pub fn new(
        mut dev_cfg: DeviceConfig,
        display_cfg: DisplayConfig,
        error_delay: Duration,
    ) -> (Self, PassthroughHandle) {
        // Zero-copy scanout needs exported buffers and packed RGB.
        dev_cfg.dma_export = true;
        dev_cfg.format = FourCc::RGB24;
        let stop = Arc::new(AtomicBool::new(false));
        (
            Self {
                dev_cfg,
                mirror: DrmMirror::new(display_cfg),
                error_delay,
                stop: stop.clone(),
            },
            PassthroughHandle { stop },
        )
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Run until stopped, reopening device and display across unplugs,
    /// signal loss and capture-busy periods.
    pub fn run(&mut self) {
        info!("passthrough loop starting");
        while !self.stopped() {
            self.tick();
            self.mirror.close();
            self.sleep_checked(self.error_delay);
        }
        self.mirror.close();
        info!("passthrough loop finished");
    }

    fn tick(&mut self) {
        if check_access(&self.dev_cfg.path).is_err() {
            self.stub_cycle(StubReason::NoSignal);
            return;
        }
        match DeviceStream::open(&self.dev_cfg) {
            Ok(dev) => match self.mirror.open(Some(&dev)) {
                Ok(None) => self.dma_cycle(&dev),
                Ok(Some(reason)) => {
                    let info = *dev.info();
                    drop(dev);
                    self.stub_ticks(reason, Some(info));
                }
                Err(DisplayError::Unplugged) => {}
                Err(e) => warn!(error = %e, code = e.code(), "display open failed"),
            },
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!("capture device is busy, showing stub");
                self.stub_cycle(StubReason::Busy);
            }
            Err(e) => {
                warn!(error = %e, code = e.code(), retryable = e.retryable(), "capture open failed");
                self.stub_cycle(StubReason::NoSignal);
            }
        }
    }

    /// Grab, flip, wait for vsync, release; every error path falls back to
    /// the outer loop which closes and retries.
    fn dma_cycle(&mut self, dev: &Arc<DeviceStream>) {
        while !self.stopped() {
            let hw = match dev.grab() {
                Ok(Grab::Frame(hw)) => hw,
                Ok(Grab::Broken) => continue,
                Ok(Grab::Timeout) => {
                    warn!("capture timeout, remounting mirror");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "grab failed");
                    return;
                }
            };
            if let Err(e) = self.mirror.expose_dma(&hw) {
                release_quiet(dev, hw);
                report_display(&e);
                return;
            }
            let vsync = self.mirror.wait_for_vsync();
            release_quiet(dev, hw);
            if let Err(e) = vsync {
                report_display(&e);
                return;
            }
        }
    }

    /// Mount the stub screen (no device attached) and paint a reason.
    fn stub_cycle(&mut self, reason: StubReason) {
        match self.mirror.open(None) {
            Ok(_) => self.stub_ticks(reason, None),
            Err(DisplayError::Unplugged) => {}
            Err(e) => warn!(error = %e, "stub display open failed"),
        }
    }

    fn stub_ticks(&mut self, reason: StubReason, dev: Option<visor_capture::DeviceInfo>) {
        while !self.stopped() {
            if let Err(e) = self.mirror.expose_stub(reason, dev.as_ref()) {
                report_display(&e);
                return;
            }
            if let Err(e) = self.mirror.wait_for_vsync() {
                report_display(&e);
                return;
            }
            // Leave the stub up for a while, then repaint so the rotation
            // keeps exercising all dumb buffers.
            self.sleep_checked(STUB_TICK);
            // The capture side may have come back; remount to probe.
            if matches!(reason, StubReason::NoSignal | StubReason::Busy)
                && check_access(&self.dev_cfg.path).is_ok()
            {
                return;
            }
        }
    }

    fn sleep_checked(&self, total: Duration) {
        let mut left = total;
        while !self.stopped() && !left.is_zero() {
            let slice = left.min(Duration::from_millis(100));
            thread::sleep(slice);
            left = left.saturating_sub(slice);
        }
    }
}

fn release_quiet(dev: &Arc<DeviceStream>, hw: visor_capture::HwBuffer) {
    if let Err(e) = dev.release(hw) {
        warn!(error = %e, "buffer release failed");
    }
}

fn report_display(err: &DisplayError) {
    match err {
        // Unplug logging is latched inside the mirror.
        DisplayError::Unplugged => {}
        e => warn!(error = %e, code = e.code(), "display error, remounting"),
    }
}
