#![doc = include_str!("../README.md")]

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};
use v4l::FourCC;
use v4l::capability::Flags;
use v4l::video::Capture;

use visor_core::prelude::{FourCc, FrameView, now_monotonic};

mod xioctl;

/// Frames shorter than this are treated as broken and retried.
const MIN_FRAME_BYTES: usize = 128;

/// Errors opening or driving the capture device.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Kernel call failed.
    #[error("device i/o error: {0}")]
    Io(#[from] io::Error),
    /// Node exists but is not a video capture device.
    #[error("{0}: not a video capture device")]
    NotCapture(String),
    /// Driver lacks streaming i/o.
    #[error("device does not support streaming i/o")]
    NoStreaming,
    /// REQBUFS yielded nothing.
    #[error("driver allocated no buffers")]
    NoBuffers,
}

impl CaptureError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Io(_) => "io_error",
            CaptureError::NotCapture(_) => "not_capture",
            CaptureError::NoStreaming => "no_streaming",
            CaptureError::NoBuffers => "no_buffers",
        }
    }

    /// Whether the error may succeed when retried. Kernel i/o failures clear
    /// when the source comes back; a node that is not a capture device does
    /// not.
    pub fn retryable(&self) -> bool {
        matches!(self, CaptureError::Io(_) | CaptureError::NoBuffers)
    }

    /// Underlying errno when the failure came from the kernel. The reinit
    /// loop logs access failures once per distinct value.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            CaptureError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

/// Capture settings handed to [`DeviceStream::open`].
///
/// # Example
/// ```rust
/// use visor_capture::DeviceConfig;
///
/// let cfg = DeviceConfig::default();
/// assert_eq!(cfg.n_bufs, 4);
/// ```
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Capture node path.
    pub path: PathBuf,
    /// Requested width; the driver may adjust it.
    pub width: u32,
    /// Requested height.
    pub height: u32,
    /// Requested pixel format.
    pub format: FourCc,
    /// Target capture rate; zero leaves the driver default.
    pub desired_fps: u32,
    /// Hardware buffers to request.
    pub n_bufs: u32,
    /// Grab timeout; expiry is persistent and forces a reopen.
    pub io_timeout: Duration,
    /// Export every buffer as a DMA-BUF descriptor.
    pub dma_export: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            width: 1920,
            height: 1080,
            format: FourCc::RGB24,
            desired_fps: 0,
            n_bufs: 4,
            io_timeout: Duration::from_secs(1),
            dma_export: false,
        }
    }
}

/// Negotiated capture geometry, available after open.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: FourCc,
    pub hz: f32,
    pub n_bufs: u32,
}

/// Outcome of one grab attempt.
pub enum Grab {
    /// A filled buffer; the caller now owns it until release.
    Frame(HwBuffer),
    /// Transient driver hiccup; retry without counting as an error.
    Broken,
    /// Nothing arrived within the i/o timeout; reopen the device.
    Timeout,
}

struct BufSlot {
    map: MmapMut,
    dma: Option<OwnedFd>,
}

/// An open, streaming capture device.
///
/// Grab and release are serialized by the callers (the stream controller
/// grabs, releaser threads release under a shared mutex); the device itself
/// only hands buffers across that boundary.
pub struct DeviceStream {
    dev: v4l::Device,
    fd: RawFd,
    info: DeviceInfo,
    bufs: Vec<BufSlot>,
    io_timeout_ms: i32,
    sequence: AtomicU64,
    // Back-reference so grabbed buffers can keep the device alive.
    self_ref: Weak<DeviceStream>,
}

impl DeviceStream {
    /// Open the device, negotiate format and rate, allocate and map `n_bufs`
    /// hardware buffers (exporting them when `dma_export` is set), and start
    /// streaming.
    pub fn open(cfg: &DeviceConfig) -> Result<Arc<Self>, CaptureError> {
        let dev = v4l::Device::with_path(&cfg.path)?;
        let caps = dev.query_caps()?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCapture(cfg.path.display().to_string()));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(CaptureError::NoStreaming);
        }
        info!(card = %caps.card, driver = %caps.driver, path = %cfg.path.display(), "opening capture device");

        let mut fmt = dev.format()?;
        fmt.width = cfg.width;
        fmt.height = cfg.height;
        fmt.fourcc = FourCC::new(&cfg.format.to_u32().to_le_bytes());
        dev.set_format(&fmt)?;
        let fmt = dev.format()?;
        let format = FourCc::from(u32::from_le_bytes(fmt.fourcc.repr));

        if cfg.desired_fps > 0 {
            let mut params = dev.params()?;
            params.interval.numerator = 1;
            params.interval.denominator = cfg.desired_fps;
            dev.set_params(&params)?;
        }
        let params = dev.params()?;
        let hz = if params.interval.numerator > 0 {
            params.interval.denominator as f32 / params.interval.numerator as f32
        } else {
            0.0
        };

        let handle = dev.handle();
        let fd = handle.fd();

        let n_bufs = xioctl::request_buffers(fd, cfg.n_bufs)?;
        if n_bufs == 0 {
            return Err(CaptureError::NoBuffers);
        }
        let mut bufs = Vec::with_capacity(n_bufs as usize);
        for index in 0..n_bufs {
            let (offset, length) = xioctl::query_buffer(fd, index)?;
            let map = unsafe { MmapOptions::new().offset(offset).len(length).map_mut(fd)? };
            let dma = if cfg.dma_export {
                let raw = xioctl::export_buffer(fd, index)?;
                Some(unsafe { OwnedFd::from_raw_fd(raw) })
            } else {
                None
            };
            bufs.push(BufSlot { map, dma });
        }
        for index in 0..n_bufs {
            xioctl::queue_buffer(fd, index)?;
        }
        xioctl::stream_on(fd)?;

        let info = DeviceInfo {
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
            hz,
            n_bufs,
        };
        info!(
            width = info.width,
            height = info.height,
            stride = info.stride,
            format = %info.format,
            hz = info.hz,
            n_bufs,
            dma_export = cfg.dma_export,
            "capture streaming"
        );
        let io_timeout_ms = cfg.io_timeout.as_millis().min(i32::MAX as u128) as i32;
        Ok(Arc::new_cyclic(|self_ref| Self {
            dev,
            fd,
            info,
            bufs,
            io_timeout_ms,
            sequence: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    /// Negotiated geometry.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Pull the next filled buffer off the kernel queue.
    pub fn grab(&self) -> Result<Grab, CaptureError> {
        if !xioctl::wait_readable(self.fd, self.io_timeout_ms)? {
            return Ok(Grab::Timeout);
        }
        let deq = xioctl::dequeue_buffer(self.fd)?;
        let flags = v4l::buffer::Flags::from_bits_truncate(deq.flags);
        if flags.contains(v4l::buffer::Flags::ERROR) || (deq.bytesused as usize) < MIN_FRAME_BYTES {
            debug!(
                index = deq.index,
                bytesused = deq.bytesused,
                "broken frame, requeued"
            );
            xioctl::queue_buffer(self.fd, deq.index)?;
            return Ok(Grab::Broken);
        }
        let Some(dev) = self.self_ref.upgrade() else {
            return Err(CaptureError::Io(io::Error::other("device is shutting down")));
        };
        Ok(Grab::Frame(HwBuffer {
            dev,
            index: deq.index,
            bytesused: deq.bytesused,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            grab_ts: now_monotonic(),
        }))
    }

    /// Return a buffer to the kernel queue, consuming it so a second release
    /// of the same buffer is unrepresentable.
    pub fn release(&self, hw: HwBuffer) -> Result<(), CaptureError> {
        xioctl::queue_buffer(self.fd, hw.index)?;
        Ok(())
    }

    /// DMA-BUF descriptor of one buffer, when exported.
    pub fn dma_fd(&self, index: usize) -> Option<BorrowedFd<'_>> {
        self.bufs.get(index)?.dma.as_ref().map(|fd| fd.as_fd())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        if let Err(e) = xioctl::stream_off(self.fd) {
            debug!(error = %e, "streamoff failed on close");
        }
        // Maps and exported fds must go before the buffers are freed.
        self.bufs.clear();
        if let Err(e) = xioctl::request_buffers(self.fd, 0) {
            debug!(error = %e, "buffer free failed on close");
        }
        info!("capture device closed");
    }
}

/// A dequeued hardware buffer with exactly one owner at any instant: the
/// kernel queue, one in-flight encode job, or one releaser slot.
pub struct HwBuffer {
    dev: Arc<DeviceStream>,
    /// Index within the device's buffer queue.
    pub index: u32,
    /// Valid payload length.
    pub bytesused: u32,
    /// Logical sequence number in the current open-cycle.
    pub sequence: u64,
    /// Monotonic grab timestamp.
    pub grab_ts: f64,
}

impl HwBuffer {
    /// The filled portion of the mapped buffer.
    pub fn payload(&self) -> &[u8] {
        let map = &self.dev.bufs[self.index as usize].map;
        let used = (self.bytesused as usize).min(map.len());
        &map[..used]
    }

    /// Borrow the buffer as a live frame for fan-out.
    pub fn view(&self) -> FrameView<'_> {
        let info = &self.dev.info;
        FrameView {
            width: info.width,
            height: info.height,
            stride: info.stride,
            format: info.format,
            hz: info.hz,
            grab_ts: self.grab_ts,
            sequence: self.sequence,
            online: true,
            payload: self.payload(),
        }
    }

    /// Raw DMA-BUF descriptor value, when the device exported one. The fd is
    /// owned by the device; this value identifies it for the display mirror.
    pub fn dma_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.dev.bufs[self.index as usize]
            .dma
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }
}

/// Probe whether the capture node is accessible for read/write, returning
/// the errno on failure so callers can log once per distinct value.
pub fn check_access(path: &Path) -> Result<(), i32> {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return Err(libc::EINVAL);
    };
    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EACCES))
    }
}

pub mod prelude {
    pub use crate::{
        CaptureError, DeviceConfig, DeviceInfo, DeviceStream, Grab, HwBuffer, check_access,
    };
    pub use visor_core::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_reports_errno() {
        let err = check_access(Path::new("/dev/video-does-not-exist")).unwrap_err();
        assert_eq!(err, libc::ENOENT);
    }

    #[test]
    fn open_missing_node_is_io_error() {
        let cfg = DeviceConfig {
            path: PathBuf::from("/dev/video-does-not-exist"),
            ..DeviceConfig::default()
        };
        let err = DeviceStream::open(&cfg).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(err.code(), "io_error");
        assert!(err.retryable(), "the node may appear later");
    }

    #[test]
    fn non_capture_nodes_are_not_retryable() {
        let err = CaptureError::NotCapture("/dev/video9".into());
        assert_eq!(err.code(), "not_capture");
        assert!(!err.retryable());
    }

    #[test]
    fn defaults_match_appliance_profile() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.format, FourCc::RGB24);
        assert_eq!(cfg.io_timeout, Duration::from_secs(1));
        assert!(!cfg.dma_export);
    }
}
