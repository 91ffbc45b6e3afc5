use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr;
use std::thread;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::frame::{FourCc, FrameView, RawFrame, now_monotonic};

const MAGIC: u64 = 0x5649534f_52534e4b; // "VISORSNK"
const VERSION: u32 = 3;
const HEADER_SIZE: usize = 128;

/// Errors from the shared-memory sink endpoints.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying shm/mmap failure.
    #[error("shared memory error: {0}")]
    Io(#[from] io::Error),
    /// Attached segment is not a sink or has an incompatible layout.
    #[error("sink segment has wrong magic or version")]
    BadSegment,
    /// Frame does not fit the segment's data area.
    #[error("frame of {got} bytes exceeds sink capacity {capacity}")]
    FrameTooLarge { got: usize, capacity: usize },
}

impl SinkError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            SinkError::Io(_) => "io_error",
            SinkError::BadSegment => "bad_segment",
            SinkError::FrameTooLarge { .. } => "frame_too_large",
        }
    }

    /// Whether the error may succeed when retried. Oversized frames and
    /// mismatched segments stay broken until reconfigured.
    pub fn retryable(&self) -> bool {
        matches!(self, SinkError::Io(_))
    }
}

/// Sink segment parameters.
///
/// # Example
/// ```rust
/// use visor_core::prelude::SinkConfig;
///
/// let cfg = SinkConfig::new("visor-jpeg-doc", 1 << 20);
/// assert_eq!(cfg.capacity, 1 << 20);
/// ```
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Segment name (without the leading slash).
    pub name: String,
    /// Data area size in bytes; one frame slot.
    pub capacity: usize,
    /// Seconds after the last reader heartbeat before `has_clients` drops.
    pub client_ttl: f64,
    /// Minimum seconds between publishes while no reader is attached.
    pub idle_interval: f64,
}

impl SinkConfig {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            client_ttl: 10.0,
            idle_interval: 1.0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SinkHeader {
    magic: u64,
    version: u32,
    key_requested: u32,
    last_server_ts: f64,
    last_client_ts: f64,
    width: u32,
    height: u32,
    stride: u32,
    format: u32,
    hz: f32,
    online: u32,
    sequence: u64,
    grab_ts: f64,
    used: u64,
}

const _: () = assert!(std::mem::size_of::<SinkHeader>() <= HEADER_SIZE);

fn shm_open_file(name: &str, create: bool) -> Result<File, SinkError> {
    let c_name = CString::new(format!("/{name}")).map_err(|_| SinkError::BadSegment)?;
    let mut flags = libc::O_RDWR;
    if create {
        flags |= libc::O_CREAT;
    }
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o644 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn shm_unlink(name: &str) {
    if let Ok(c_name) = CString::new(format!("/{name}")) {
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }
    }
}

/// Advisory whole-segment lock; readers and the writer serialize through it.
struct SegmentLock<'a>(&'a File);

impl<'a> SegmentLock<'a> {
    fn acquire(file: &'a File) -> Result<Self, SinkError> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self(file))
    }

    fn try_acquire(file: &'a File) -> Result<Option<Self>, SinkError> {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self(file)));
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err.into())
        }
    }
}

impl Drop for SegmentLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.0.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

fn read_header(map: &MmapMut) -> SinkHeader {
    unsafe { ptr::read_volatile(map.as_ptr() as *const SinkHeader) }
}

fn write_header(map: &mut MmapMut, header: &SinkHeader) {
    unsafe { ptr::write_volatile(map.as_mut_ptr() as *mut SinkHeader, *header) }
}

/// Writer end of a shared-memory sink: one frame slot, latest-wins.
///
/// `has_clients` is heartbeat-based and lags by up to the reader poll
/// interval; policies built on it must tolerate that.
///
/// # Example
/// ```rust
/// use visor_core::prelude::{MemSinkServer, RawFrame, SinkConfig};
///
/// let cfg = SinkConfig::new(format!("visor-doc-{}", std::process::id()), 4096);
/// let mut sink = MemSinkServer::open(&cfg).unwrap();
/// let mut frame = RawFrame::new();
/// frame.assign(&[0u8; 16]);
/// let mut key_requested = false;
/// sink.put(frame.as_view(), &mut key_requested).unwrap();
/// ```
pub struct MemSinkServer {
    name: String,
    file: File,
    map: MmapMut,
    capacity: usize,
    client_ttl: f64,
    idle_interval: f64,
    last_put_ts: f64,
}

impl MemSinkServer {
    /// Create (or take over) the named segment and initialize its header.
    pub fn open(cfg: &SinkConfig) -> Result<Self, SinkError> {
        let file = shm_open_file(&cfg.name, true)?;
        let total = HEADER_SIZE + cfg.capacity;
        file.set_len(total as u64)?;
        let mut map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };

        let header = SinkHeader {
            magic: MAGIC,
            version: VERSION,
            key_requested: 0,
            last_server_ts: 0.0,
            last_client_ts: 0.0,
            width: 0,
            height: 0,
            stride: 0,
            format: 0,
            hz: 0.0,
            online: 0,
            sequence: 0,
            grab_ts: 0.0,
            used: 0,
        };
        {
            let _lock = SegmentLock::acquire(&file)?;
            write_header(&mut map, &header);
        }
        debug!(name = %cfg.name, capacity = cfg.capacity, "memory sink created");
        Ok(Self {
            name: cfg.name.clone(),
            file,
            map,
            capacity: cfg.capacity,
            client_ttl: cfg.client_ttl,
            idle_interval: cfg.idle_interval,
            last_put_ts: 0.0,
        })
    }

    /// Whether a reader has heartbeat recently. Not real-time.
    pub fn has_clients(&self) -> bool {
        let header = read_header(&self.map);
        header.last_client_ts > 0.0 && now_monotonic() - header.last_client_ts < self.client_ttl
    }

    /// Decide whether `put` should run for this frame: always when a client
    /// is attached, otherwise at most once per idle interval.
    pub fn check(&mut self) -> bool {
        if self.has_clients() {
            return true;
        }
        now_monotonic() - self.last_put_ts >= self.idle_interval
    }

    /// Publish a frame. A segment busy with a slow reader drops the frame
    /// rather than blocking the pipeline. `key_requested` reports (and
    /// clears) the reader's pending keyframe request.
    pub fn put(&mut self, frame: FrameView<'_>, key_requested: &mut bool) -> Result<(), SinkError> {
        *key_requested = false;
        if frame.payload.len() > self.capacity {
            return Err(SinkError::FrameTooLarge {
                got: frame.payload.len(),
                capacity: self.capacity,
            });
        }
        let Some(_lock) = SegmentLock::try_acquire(&self.file)? else {
            debug!(name = %self.name, "sink busy, frame dropped");
            return Ok(());
        };
        let mut header = read_header(&self.map);
        *key_requested = header.key_requested != 0;
        header.key_requested = 0;
        header.last_server_ts = now_monotonic();
        header.width = frame.width;
        header.height = frame.height;
        header.stride = frame.stride;
        header.format = frame.format.to_u32();
        header.hz = frame.hz;
        header.online = frame.online as u32;
        header.sequence = frame.sequence;
        header.grab_ts = frame.grab_ts;
        header.used = frame.payload.len() as u64;
        self.map[HEADER_SIZE..HEADER_SIZE + frame.payload.len()].copy_from_slice(frame.payload);
        write_header(&mut self.map, &header);
        self.last_put_ts = header.last_server_ts;
        Ok(())
    }
}

impl Drop for MemSinkServer {
    fn drop(&mut self) {
        shm_unlink(&self.name);
    }
}

/// Reader end of a shared-memory sink, used by network front-ends and tests.
///
/// Every poll writes a heartbeat timestamp, which is what drives the writer's
/// `has_clients`.
pub struct MemSinkClient {
    file: File,
    map: MmapMut,
    capacity: usize,
    last_seen_ts: f64,
}

impl MemSinkClient {
    /// Attach to an existing segment.
    pub fn open(name: &str) -> Result<Self, SinkError> {
        let file = shm_open_file(name, false)?;
        let total = file.metadata()?.len() as usize;
        if total < HEADER_SIZE {
            return Err(SinkError::BadSegment);
        }
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        let header = read_header(&map);
        if header.magic != MAGIC || header.version != VERSION {
            return Err(SinkError::BadSegment);
        }
        Ok(Self {
            file,
            map,
            capacity: total - HEADER_SIZE,
            last_seen_ts: 0.0,
        })
    }

    /// Ask the writer to make the next motion-video frame a keyframe.
    pub fn request_key(&mut self) -> Result<(), SinkError> {
        let _lock = SegmentLock::acquire(&self.file)?;
        let mut header = read_header(&self.map);
        header.key_requested = 1;
        write_header(&mut self.map, &header);
        Ok(())
    }

    /// Wait up to `timeout` for a frame newer than the last one seen,
    /// heartbeating on every poll.
    pub fn wait_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>, SinkError> {
        let deadline = now_monotonic() + timeout.as_secs_f64();
        loop {
            {
                let _lock = SegmentLock::acquire(&self.file)?;
                let mut header = read_header(&self.map);
                header.last_client_ts = now_monotonic();
                write_header(&mut self.map, &header);
                if header.last_server_ts > self.last_seen_ts && header.used > 0 {
                    self.last_seen_ts = header.last_server_ts;
                    let used = (header.used as usize).min(self.capacity);
                    let mut frame = RawFrame::new();
                    frame.set_geometry(
                        header.width,
                        header.height,
                        header.stride,
                        FourCc::from(header.format),
                        header.hz,
                    );
                    frame.sequence = header.sequence;
                    frame.grab_ts = header.grab_ts;
                    frame.online = header.online != 0;
                    frame.assign(&self.map[HEADER_SIZE..HEADER_SIZE + used]);
                    return Ok(Some(frame));
                }
            }
            if now_monotonic() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "visor-test-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn live_frame(seq: u64, payload: &[u8]) -> RawFrame {
        let mut frame = RawFrame::new();
        frame.set_geometry(4, 4, 12, FourCc::RGB24, 30.0);
        frame.sequence = seq;
        frame.online = true;
        frame.assign(payload);
        frame
    }

    #[test]
    fn roundtrip_and_heartbeat() {
        let cfg = SinkConfig::new(unique_name("rt"), 4096);
        let mut server = MemSinkServer::open(&cfg).unwrap();
        let mut client = MemSinkClient::open(&cfg.name).unwrap();

        assert!(!server.has_clients());

        let mut key_requested = false;
        server.put(live_frame(5, &[7u8; 48]).as_view(), &mut key_requested).unwrap();
        assert!(!key_requested);

        let got = client
            .wait_frame(Duration::from_millis(200))
            .unwrap()
            .expect("frame");
        assert_eq!(got.sequence, 5);
        assert_eq!(got.payload(), &[7u8; 48]);
        assert!(got.online);

        // Client heartbeat from the wait above is now visible to the server.
        assert!(server.has_clients());
    }

    #[test]
    fn key_request_surfaces_once() {
        let cfg = SinkConfig::new(unique_name("key"), 4096);
        let mut server = MemSinkServer::open(&cfg).unwrap();
        let mut client = MemSinkClient::open(&cfg.name).unwrap();

        client.request_key().unwrap();

        let mut key_requested = false;
        server.put(live_frame(1, &[0u8; 8]).as_view(), &mut key_requested).unwrap();
        assert!(key_requested);
        server.put(live_frame(2, &[0u8; 8]).as_view(), &mut key_requested).unwrap();
        assert!(!key_requested);
    }

    #[test]
    fn idle_interval_gates_publishing() {
        let mut cfg = SinkConfig::new(unique_name("gate"), 4096);
        cfg.idle_interval = 5.0;
        let mut server = MemSinkServer::open(&cfg).unwrap();

        assert!(server.check(), "first publish passes the gate");
        let mut key_requested = false;
        server.put(live_frame(1, &[0u8; 8]).as_view(), &mut key_requested).unwrap();
        assert!(!server.check(), "no clients and interval not elapsed");
    }

    #[test]
    fn oversized_frame_rejected() {
        let cfg = SinkConfig::new(unique_name("big"), 16);
        let mut server = MemSinkServer::open(&cfg).unwrap();
        let mut key_requested = false;
        let err = server
            .put(live_frame(1, &[0u8; 64]).as_view(), &mut key_requested)
            .unwrap_err();
        assert!(matches!(err, SinkError::FrameTooLarge { .. }));
        assert_eq!(err.code(), "frame_too_large");
        assert!(!err.retryable(), "the frame will not shrink on retry");
    }
}
