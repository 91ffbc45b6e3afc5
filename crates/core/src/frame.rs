use std::fmt;
use std::str::FromStr;

/// Monotonic clock reading in seconds.
///
/// Backed by `CLOCK_MONOTONIC` so values are comparable across processes
/// sharing a memory sink, unlike `Instant` which cannot be exported.
///
/// # Example
/// ```rust
/// use visor_core::prelude::now_monotonic;
///
/// let a = now_monotonic();
/// let b = now_monotonic();
/// assert!(b >= a);
/// ```
pub fn now_monotonic() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid clock id.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Truncate a monotonic timestamp to whole seconds.
pub fn floor_seconds(ts: f64) -> i64 {
    ts.floor() as i64
}

/// Four-character code describing a pixel/stream format.
///
/// # Example
/// ```rust
/// use visor_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"RGB3");
/// assert_eq!(fcc, FourCc::RGB24);
/// assert_eq!(fcc.to_string(), "RGB3");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Packed 24-bit RGB, the only format the display mirror can scan out.
    pub const RGB24: FourCc = FourCc(*b"RGB3");
    /// Motion JPEG bitstream.
    pub const MJPEG: FourCc = FourCc(*b"MJPG");
    /// Single JPEG image.
    pub const JPEG: FourCc = FourCc(*b"JPEG");
    /// Packed 4:2:2 YUV, common on capture hardware.
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    /// H.264 byte stream.
    pub const H264: FourCc = FourCc(*b"H264");

    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding as used by V4L2.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl Default for FourCc {
    fn default() -> Self {
        FourCc([0; 4])
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// A single frame moving through the pipeline: a contiguous payload plus the
/// geometry and provenance metadata every consumer needs.
///
/// `online` distinguishes frames produced from a live capture from synthetic
/// placeholders (blank screens, stubs).
///
/// # Example
/// ```rust
/// use visor_core::prelude::{FourCc, RawFrame};
///
/// let mut frame = RawFrame::new();
/// frame.set_geometry(4, 4, 12, FourCc::RGB24, 0.0);
/// frame.assign(&[0u8; 48]);
/// assert_eq!(frame.payload().len(), 48);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RawFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row; zero for compressed payloads.
    pub stride: u32,
    /// Payload format.
    pub format: FourCc,
    /// Declared refresh rate of the source, zero when unknown.
    pub hz: f32,
    /// Monotonic timestamp of the grab that produced this frame.
    pub grab_ts: f64,
    /// Logical sequence number within the current capture cycle.
    pub sequence: u64,
    /// True iff the frame came from a live capture in the current open-cycle.
    pub online: bool,
    data: Vec<u8>,
    used: usize,
}

impl RawFrame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update geometry fields in one call.
    pub fn set_geometry(&mut self, width: u32, height: u32, stride: u32, format: FourCc, hz: f32) {
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.format = format;
        self.hz = hz;
    }

    /// The valid portion of the payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Bytes currently used.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Drop the payload without releasing its allocation.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    /// Replace the payload with a copy of `bytes`.
    pub fn assign(&mut self, bytes: &[u8]) {
        if self.data.len() < bytes.len() {
            self.data.resize(bytes.len(), 0);
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.used = bytes.len();
    }

    /// Expose a writable payload of exactly `len` bytes.
    pub fn payload_mut(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        self.used = len;
        &mut self.data[..len]
    }

    /// Copy payload and all metadata from another frame, reusing this frame's
    /// allocation where possible.
    pub fn copy_from(&mut self, src: &RawFrame) {
        self.copy_from_view(src.as_view());
    }

    /// Borrow this frame as a [`FrameView`].
    pub fn as_view(&self) -> FrameView<'_> {
        FrameView {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            hz: self.hz,
            grab_ts: self.grab_ts,
            sequence: self.sequence,
            online: self.online,
            payload: self.payload(),
        }
    }

    /// Copy payload and metadata out of a borrowed view.
    pub fn copy_from_view(&mut self, src: FrameView<'_>) {
        self.width = src.width;
        self.height = src.height;
        self.stride = src.stride;
        self.format = src.format;
        self.hz = src.hz;
        self.grab_ts = src.grab_ts;
        self.sequence = src.sequence;
        self.online = src.online;
        self.assign(src.payload);
    }
}

/// Borrowed frame: the metadata of a [`RawFrame`] over a payload owned
/// elsewhere, typically a kernel-mapped hardware buffer. Lets consumers fan
/// out without copying first.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: FourCc,
    pub hz: f32,
    pub grab_ts: f64,
    pub sequence: u64,
    pub online: bool,
    pub payload: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_roundtrip() {
        let fcc = FourCc::from(FourCc::MJPEG.to_u32());
        assert_eq!(fcc, FourCc::MJPEG);
        assert_eq!("RGB3".parse::<FourCc>().unwrap(), FourCc::RGB24);
        assert!("TOOLONG".parse::<FourCc>().is_err());
    }

    #[test]
    fn copy_reuses_allocation() {
        let mut a = RawFrame::new();
        a.set_geometry(2, 2, 6, FourCc::RGB24, 30.0);
        a.sequence = 7;
        a.online = true;
        a.assign(&[1u8; 12]);

        let mut b = RawFrame::new();
        b.assign(&[0u8; 64]);
        b.copy_from(&a);
        assert_eq!(b.payload(), &[1u8; 12]);
        assert_eq!(b.sequence, 7);
        assert!(b.online);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut f = RawFrame::new();
        f.assign(&[9u8; 32]);
        f.clear();
        assert_eq!(f.used(), 0);
        assert!(f.payload().is_empty());
    }
}
