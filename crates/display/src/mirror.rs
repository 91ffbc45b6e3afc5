use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use drm::Device as _;
use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{
    Device as _, Event, Mode, ModeFlags, ModeTypeFlags, PageFlipFlags, connector, crtc,
    dumbbuffer::DumbBuffer, framebuffer, property,
};
use tracing::{debug, error, info, warn};

use visor_capture::{DeviceInfo, DeviceStream, HwBuffer};
use visor_codec::frametext::FrameText;
use visor_core::prelude::FourCc;

use crate::DisplayConfig;
use crate::card::Card;
use crate::mode::{ModeCandidate, select_best};
use crate::status::StatusProbe;

const STUB_BUFFERS: usize = 4;
const DPMS_ON: u64 = 0;
const DPMS_OFF: u64 = 3;

/// Errors from the display mirror.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// Kernel call failed.
    #[error("display i/o error: {0}")]
    Io(#[from] io::Error),
    /// Connector reports disconnected; callers treat this as non-fatal.
    #[error("display is not plugged")]
    Unplugged,
    /// No page-flip event arrived within the configured timeout.
    #[error("timed out waiting for vsync")]
    VsyncTimeout,
    /// Configured connector name was not found on the card.
    #[error("connector {0} not found")]
    NoConnector(String),
    /// No CRTC can drive the connector.
    #[error("no compatible CRTC for the connector")]
    NoCrtc,
    /// Required driver capability missing.
    #[error("driver lacks the {0} capability")]
    MissingCap(&'static str),
    /// Operation requires an open mirror.
    #[error("display mirror is closed")]
    Closed,
    /// Operation does not match the mount kind (DMA vs stub).
    #[error("mirror is mounted for {mounted}, operation needs {needed}")]
    WrongMount {
        mounted: &'static str,
        needed: &'static str,
    },
}

impl DisplayError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DisplayError::Io(_) => "io_error",
            DisplayError::Unplugged => "unplugged",
            DisplayError::VsyncTimeout => "vsync_timeout",
            DisplayError::NoConnector(_) => "no_connector",
            DisplayError::NoCrtc => "no_crtc",
            DisplayError::MissingCap(_) => "missing_cap",
            DisplayError::Closed => "closed",
            DisplayError::WrongMount { .. } => "wrong_mount",
        }
    }

    /// Whether the error may succeed when retried. Unplugs, vsync timeouts
    /// and kernel i/o clear on a remount; missing hardware capabilities and
    /// caller mistakes do not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            DisplayError::Io(_) | DisplayError::Unplugged | DisplayError::VsyncTimeout
        )
    }
}

/// Why the mirror is painting a stub instead of scanning out capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubReason {
    /// Stub requested by configuration.
    User,
    /// Capture geometry has no usable mode on this display.
    BadResolution,
    /// Capture pixel format cannot be scanned out.
    BadFormat,
    /// No capture signal.
    NoSignal,
    /// The capture device is held by the streamer.
    Busy,
}

const BANNER: &str = "=== VISOR ===";

impl StubReason {
    /// Rendered caption for this reason.
    pub fn caption(&self, dev: Option<&DeviceInfo>) -> String {
        match self {
            StubReason::User => BANNER.to_string(),
            StubReason::BadResolution => {
                let (width, height, hz) = match dev {
                    Some(info) => (info.width, info.height, info.hz),
                    None => (0, 0, 0.0),
                };
                format!(
                    "{BANNER}\n \n< UNSUPPORTED RESOLUTION >\n \n< {width}x{height}p{hz:.2} >\n \nby this display"
                )
            }
            StubReason::BadFormat => format!(
                "{BANNER}\n \n< UNSUPPORTED CAPTURE FORMAT >\n \nPlease check the logs and report a bug:\n \n- https://github.com/visor-kvm/visor -"
            ),
            StubReason::NoSignal => format!("{BANNER}\n \n< NO SIGNAL >"),
            StubReason::Busy => format!("{BANNER}\n \n< ONLINE IS ACTIVE >"),
        }
    }
}

/// Mirror lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Closed,
    OpenForDma,
    OpenForStub,
}

enum DisplayBuffer {
    Dumb {
        fb: framebuffer::Handle,
        db: DumbBuffer,
    },
    Imported {
        fb: framebuffer::Handle,
        dma_fd: RawFd,
    },
}

struct Runtime {
    card: Card,
    conn: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    saved: Option<crtc::Info>,
    dpms_prop: Option<property::Handle>,
    dpms_on: Option<bool>,
    bufs: Vec<DisplayBuffer>,
    for_stub: bool,
    has_vsync: bool,
    exposing_dma_fd: Option<RawFd>,
    stub_index: usize,
}

impl Runtime {
    fn ensure_dpms(&mut self, on: bool) {
        let Some(prop) = self.dpms_prop else {
            return;
        };
        if self.dpms_on == Some(on) {
            return;
        }
        info!(on, "changing DPMS power mode");
        let value = if on { DPMS_ON } else { DPMS_OFF };
        if let Err(e) = self.card.set_property(self.conn, prop, value) {
            warn!(error = %e, on, "DPMS set failed (ignored)");
        }
        self.dpms_on = Some(on);
    }

    fn pump_events(&mut self) -> io::Result<()> {
        for event in self.card.receive_events()? {
            if let Event::PageFlip(_) = event {
                debug!("got vsync signal");
                self.has_vsync = true;
                self.exposing_dma_fd = None;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(saved) = self.saved.take() {
            debug!("restoring CRTC");
            if let Err(e) = self.card.set_crtc(
                self.crtc,
                saved.framebuffer(),
                saved.position(),
                &[self.conn],
                saved.mode(),
            ) {
                warn!(error = %e, "CRTC restore failed");
            }
        }
        for buf in self.bufs.drain(..) {
            match buf {
                DisplayBuffer::Dumb { fb, db } => {
                    let _ = self.card.destroy_framebuffer(fb);
                    let _ = self.card.destroy_dumb_buffer(db);
                }
                DisplayBuffer::Imported { fb, .. } => {
                    let _ = self.card.destroy_framebuffer(fb);
                }
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Capture buffer imported over PRIME, wrapped for framebuffer creation:
/// scanout geometry comes from the chosen mode, the pitch from the capture
/// stride.
struct ImportedBuffer {
    handle: drm::buffer::Handle,
    size: (u32, u32),
    pitch: u32,
}

impl Buffer for ImportedBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Rgb888
    }

    fn pitch(&self) -> u32 {
        self.pitch
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.handle
    }
}

/// Direct-rendering display mirror.
///
/// Single-threaded by contract: one driver loop opens it, pages frames or
/// stubs through it, and closes it. See the crate README for the state
/// machine.
pub struct DrmMirror {
    cfg: DisplayConfig,
    status: StatusProbe,
    ft: FrameText,
    run: Option<Runtime>,
    unplugged_reported: bool,
}

impl DrmMirror {
    pub fn new(cfg: DisplayConfig) -> Self {
        let status = StatusProbe::new(&cfg.path, &cfg.port);
        Self {
            cfg,
            status,
            ft: FrameText::new(),
            run: None,
            unplugged_reported: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MirrorState {
        match &self.run {
            None => MirrorState::Closed,
            Some(run) if run.for_stub => MirrorState::OpenForStub,
            Some(_) => MirrorState::OpenForDma,
        }
    }

    /// Chosen mode geometry, when open.
    pub fn mode_size(&self) -> Option<(u32, u32)> {
        self.run.as_ref().map(|run| {
            let (w, h) = run.mode.size();
            (w as u32, h as u32)
        })
    }

    fn check_status(&mut self) -> Result<(), DisplayError> {
        if self.status.connected()? {
            Ok(())
        } else {
            if !self.unplugged_reported {
                error!(port = %self.cfg.port, "display is not plugged");
                self.unplugged_reported = true;
            }
            Err(DisplayError::Unplugged)
        }
    }

    /// Mount the display. With a device, tries zero-copy DMA scanout and
    /// falls back to a stub mount with a reason; without one, mounts the
    /// user-requested stub. `Err(Unplugged)` is non-fatal to callers.
    pub fn open(&mut self, dev: Option<&DeviceStream>) -> Result<Option<StubReason>, DisplayError> {
        if let Err(e) = self.check_status() {
            self.close();
            return Err(e);
        }
        info!(
            target_kind = if dev.is_some() { "DMA" } else { "STUB" },
            path = %self.cfg.path.display(),
            port = %self.cfg.port,
            "configuring DRM device"
        );

        let result = self.open_inner(dev);
        match &result {
            Ok(reason) => {
                self.unplugged_reported = false;
                info!(stub = ?reason, "display mirror opened");
            }
            Err(_) => self.close(),
        }
        result
    }

    fn open_inner(&mut self, dev: Option<&DeviceStream>) -> Result<Option<StubReason>, DisplayError> {
        let card = Card::open(&self.cfg.path)?;

        let mut stub = None;
        let info = dev.map(|d| *d.info());
        match &info {
            None => stub = Some(StubReason::User),
            Some(info) if info.format != FourCc::RGB24 => {
                error!(format = %info.format, "capture format cannot be scanned out, forcing stub");
                stub = Some(StubReason::BadFormat);
            }
            Some(_) => {}
        }

        if card.get_driver_capability(drm::DriverCapability::DumbBuffer)? == 0 {
            return Err(DisplayError::MissingCap("DUMB_BUFFER"));
        }
        if stub.is_none() && card.get_driver_capability(drm::DriverCapability::Prime)? == 0 {
            return Err(DisplayError::MissingCap("PRIME"));
        }

        let (want_width, want_height, want_hz) = match (&stub, &info) {
            (None, Some(info)) => (info.width, info.height, info.hz),
            _ => (0, 0, 0.0),
        };

        let resources = card.resource_handles()?;
        let mut found = None;
        for handle in resources.connectors() {
            let conn = card.get_connector(*handle, false)?;
            let name = format!("{}-{}", interface_name(conn.interface()), conn.interface_id());
            if name == self.cfg.port {
                found = Some(conn);
                break;
            }
        }
        let Some(conn) = found else {
            return Err(DisplayError::NoConnector(self.cfg.port.clone()));
        };
        info!(port = %self.cfg.port, "using connector");
        if conn.state() != connector::State::Connected {
            if !self.unplugged_reported {
                error!(port = %self.cfg.port, "connector is not connected");
                self.unplugged_reported = true;
            }
            return Err(DisplayError::Unplugged);
        }

        let candidates: Vec<ModeCandidate> = conn.modes().iter().map(candidate_from).collect();
        let Some(best) = select_best(&candidates, want_width, want_height, want_hz) else {
            // A connected port with no modes behaves like an unplug.
            if !self.unplugged_reported {
                error!("no usable display modes");
                self.unplugged_reported = true;
            }
            return Err(DisplayError::Unplugged);
        };
        let mode = conn.modes()[best];
        let (mode_w, mode_h) = mode.size();
        info!(
            width = mode_w,
            height = mode_h,
            hz = mode.vrefresh(),
            "using best mode"
        );

        if stub.is_none() && (want_width != mode_w as u32 || want_height > mode_h as u32) {
            error!("no appropriate mode for the capture geometry, forcing stub");
            stub = Some(StubReason::BadResolution);
        }

        let dpms_prop = find_dpms(&card, conn.handle())?;
        let crtc = find_crtc(&card, &resources, &conn)?.ok_or(DisplayError::NoCrtc)?;

        let mut run = Runtime {
            card,
            conn: conn.handle(),
            crtc,
            mode,
            saved: None,
            dpms_prop,
            dpms_on: None,
            bufs: Vec::new(),
            for_stub: stub.is_some(),
            has_vsync: true,
            exposing_dma_fd: None,
            stub_index: 0,
        };
        init_buffers(&mut run, if stub.is_some() { None } else { dev })?;

        run.saved = Some(run.card.get_crtc(run.crtc)?);
        debug!("setting up CRTC");
        let first_fb = match &run.bufs[0] {
            DisplayBuffer::Dumb { fb, .. } => *fb,
            DisplayBuffer::Imported { fb, .. } => *fb,
        };
        run.card
            .set_crtc(run.crtc, Some(first_fb), (0, 0), &[run.conn], Some(run.mode))?;

        self.run = Some(run);
        Ok(stub)
    }

    /// Unmount, restoring the saved CRTC and releasing all buffers.
    pub fn close(&mut self) {
        if let Some(mut run) = self.run.take() {
            if run.exposing_dma_fd.is_some() {
                // The imported buffer is still on scanout; let the flip land
                // before tearing the framebuffers down.
                self.run = Some(run);
                let _ = self.wait_for_vsync();
                run = match self.run.take() {
                    Some(run) => run,
                    None => return,
                };
            }
            drop(run);
            info!("display mirror closed");
        }
    }

    /// Page-flip to the framebuffer imported from `hw`. Requires a DMA mount.
    pub fn expose_dma(&mut self, hw: &HwBuffer) -> Result<(), DisplayError> {
        if let Err(e) = self.check_status() {
            return Err(e);
        }
        let Some(run) = self.run.as_mut() else {
            return Err(DisplayError::Closed);
        };
        if run.for_stub {
            return Err(DisplayError::WrongMount {
                mounted: "stub",
                needed: "DMA",
            });
        }
        run.ensure_dpms(true);

        let Some(DisplayBuffer::Imported { fb, dma_fd }) = run.bufs.get(hw.index as usize) else {
            return Err(DisplayError::Closed);
        };
        let (fb, dma_fd) = (*fb, *dma_fd);
        run.has_vsync = false;
        debug!(index = hw.index, "exposing DMA framebuffer");
        run.card.page_flip(
            run.crtc,
            fb,
            PageFlipFlags::EVENT | PageFlipFlags::ASYNC,
            None,
        )?;
        run.exposing_dma_fd = Some(dma_fd);
        Ok(())
    }

    /// Rasterize the reason caption into the next stub buffer and flip to
    /// it. Requires a stub mount.
    pub fn expose_stub(
        &mut self,
        reason: StubReason,
        dev: Option<&DeviceInfo>,
    ) -> Result<(), DisplayError> {
        if let Err(e) = self.check_status() {
            return Err(e);
        }
        let Some(run) = self.run.as_mut() else {
            return Err(DisplayError::Closed);
        };
        if !run.for_stub {
            return Err(DisplayError::WrongMount {
                mounted: "DMA",
                needed: "stub",
            });
        }
        run.ensure_dpms(true);

        let (mode_w, mode_h) = run.mode.size();
        let frame = self.ft.draw(&reason.caption(dev), mode_w as u32, mode_h as u32);

        let index = run.stub_index;
        run.stub_index = (run.stub_index + 1) % run.bufs.len();
        run.has_vsync = false;
        let crtc = run.crtc;

        let Runtime { card, bufs, .. } = &mut *run;
        let Some(DisplayBuffer::Dumb { fb, db }) = bufs.get_mut(index) else {
            return Err(DisplayError::Closed);
        };
        let fb = *fb;
        {
            let pitch = db.pitch() as usize;
            let row = (mode_w as usize * 3).min(pitch);
            let mut mapping = card.map_dumb_buffer(db)?;
            let dst = mapping.as_mut();
            let src = frame.payload();
            let stride = frame.stride as usize;
            for y in 0..(mode_h as usize) {
                let src_off = y * stride;
                let dst_off = y * pitch;
                if src_off + row > src.len() || dst_off + row > dst.len() {
                    break;
                }
                dst[dst_off..dst_off + row].copy_from_slice(&src[src_off..src_off + row]);
            }
        }
        debug!(index, ?reason, "exposing stub framebuffer");
        card.page_flip(crtc, fb, PageFlipFlags::EVENT | PageFlipFlags::ASYNC, None)?;
        Ok(())
    }

    /// Wait for the pending page-flip to land. Returns immediately when no
    /// flip is outstanding.
    pub fn wait_for_vsync(&mut self) -> Result<(), DisplayError> {
        if let Err(e) = self.check_status() {
            return Err(e);
        }
        let Some(run) = self.run.as_mut() else {
            return Err(DisplayError::Closed);
        };
        run.ensure_dpms(true);
        if run.has_vsync {
            return Ok(());
        }

        let fd = run.card.as_fd().as_raw_fd();
        let timeout_ms = (self.cfg.timeout.max(1) * 1000).min(i32::MAX as u64) as i32;
        debug!("polling for vsync");
        if !wait_readable(fd, timeout_ms)? {
            error!("device timeout while waiting for vsync");
            return Err(DisplayError::VsyncTimeout);
        }
        run.pump_events()?;
        Ok(())
    }

    /// Power the connector down via its DPMS property. DPMS transitions can
    /// flap the connector status; a disconnected reading here is fine.
    pub fn dpms_power_off(&mut self) -> Result<(), DisplayError> {
        match self.check_status() {
            Ok(()) => {}
            Err(DisplayError::Unplugged) => return Ok(()),
            Err(e) => return Err(e),
        }
        let Some(run) = self.run.as_mut() else {
            return Err(DisplayError::Closed);
        };
        run.ensure_dpms(false);
        Ok(())
    }
}

impl Drop for DrmMirror {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn candidate_from(mode: &Mode) -> ModeCandidate {
    let (width, height) = mode.size();
    ModeCandidate {
        width: width as u32,
        height: height as u32,
        hz: mode.vrefresh() as f32,
        interlaced: mode.flags().contains(ModeFlags::INTERLACE),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    }
}

fn find_dpms(card: &Card, conn: connector::Handle) -> Result<Option<property::Handle>, DisplayError> {
    let props = card.get_properties(conn)?;
    let (handles, _) = props.as_props_and_values();
    for handle in handles {
        let prop = card.get_property(*handle)?;
        if prop.name().to_str() == Ok("DPMS") {
            info!("using DPMS property");
            return Ok(Some(*handle));
        }
    }
    info!("connector has no DPMS property");
    Ok(None)
}

fn find_crtc(
    card: &Card,
    resources: &drm::control::ResourceHandles,
    conn: &connector::Info,
) -> Result<Option<crtc::Handle>, DisplayError> {
    for enc_handle in conn.encoders() {
        let Ok(enc) = card.get_encoder(*enc_handle) else {
            continue;
        };
        if let Some(crtc) = resources.filter_crtcs(enc.possible_crtcs()).into_iter().next() {
            info!(crtc = ?crtc, "using CRTC");
            return Ok(Some(crtc));
        }
    }
    Ok(None)
}

fn init_buffers(run: &mut Runtime, dev: Option<&DeviceStream>) -> Result<(), DisplayError> {
    let (mode_w, mode_h) = run.mode.size();
    match dev {
        None => {
            debug!(count = STUB_BUFFERS, "allocating dumb buffers");
            for _ in 0..STUB_BUFFERS {
                let mut db = run.card.create_dumb_buffer(
                    (mode_w as u32, mode_h as u32),
                    DrmFourcc::Rgb888,
                    24,
                )?;
                {
                    let mut mapping = run.card.map_dumb_buffer(&mut db)?;
                    mapping.as_mut().fill(0);
                }
                let fb = run.card.add_framebuffer(&db, 24, 24)?;
                run.bufs.push(DisplayBuffer::Dumb { fb, db });
            }
        }
        Some(dev) => {
            let info = dev.info();
            debug!(count = info.n_bufs, "importing DMA buffers");
            for index in 0..info.n_bufs as usize {
                let Some(dma) = dev.dma_fd(index) else {
                    return Err(DisplayError::MissingCap("DMA export"));
                };
                let handle = run.card.prime_fd_to_buffer(dma)?;
                let imported = ImportedBuffer {
                    handle,
                    size: (mode_w as u32, mode_h as u32),
                    pitch: info.stride,
                };
                let fb = run.card.add_framebuffer(&imported, 24, 24)?;
                run.bufs.push(DisplayBuffer::Imported {
                    fb,
                    dma_fd: dma.as_raw_fd(),
                });
            }
        }
    }
    Ok(())
}

fn interface_name(interface: connector::Interface) -> &'static str {
    use connector::Interface;
    match interface {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_format_caption_names_the_problem() {
        let caption = StubReason::BadFormat.caption(None);
        assert!(caption.contains("UNSUPPORTED CAPTURE FORMAT"));
    }

    #[test]
    fn bad_resolution_caption_carries_geometry() {
        let info = DeviceInfo {
            width: 1920,
            height: 1200,
            stride: 5760,
            format: FourCc::RGB24,
            hz: 60.0,
            n_bufs: 4,
        };
        let caption = StubReason::BadResolution.caption(Some(&info));
        assert!(caption.contains("UNSUPPORTED RESOLUTION"));
        assert!(caption.contains("1920x1200p60.00"));
    }

    #[test]
    fn remaining_captions() {
        assert!(StubReason::NoSignal.caption(None).contains("NO SIGNAL"));
        assert!(StubReason::Busy.caption(None).contains("ONLINE IS ACTIVE"));
        assert_eq!(StubReason::User.caption(None), BANNER);
    }

    #[test]
    fn error_classification() {
        assert_eq!(DisplayError::Unplugged.code(), "unplugged");
        assert!(DisplayError::Unplugged.retryable());
        assert!(DisplayError::VsyncTimeout.retryable());
        assert!(!DisplayError::MissingCap("PRIME").retryable());
        assert!(!DisplayError::NoCrtc.retryable());
    }
}
