use tracing::{debug, warn};

use visor_codec::{CodecError, VideoEncoder};
use visor_core::prelude::{FrameView, MemSinkServer, RawFrame};

/// Motion-video half of the pipeline: raw frames in grab order go through an
/// injected encoder into a shared-memory sink.
///
/// A keyframe is forced when the controller lifted a slowdown (so a
/// late-arriving client gets a decodable first frame) or when a sink reader
/// requested one; the request stays armed until a keyframe actually goes
/// out.
pub struct MotionStream {
    enc: Box<dyn VideoEncoder>,
    sink: MemSinkServer,
    dest: RawFrame,
    key_required: bool,
}

impl MotionStream {
    pub fn new(
        mut enc: Box<dyn VideoEncoder>,
        sink: MemSinkServer,
        bitrate_kbps: u32,
        gop: u32,
    ) -> Result<Self, CodecError> {
        enc.configure(bitrate_kbps, gop)?;
        Ok(Self {
            enc,
            sink,
            dest: RawFrame::new(),
            key_required: false,
        })
    }

    /// Whether a reader is attached to the video sink (heartbeat-lagged).
    pub fn has_clients(&self) -> bool {
        self.sink.has_clients()
    }

    /// Encode and publish one frame.
    pub fn process(&mut self, frame: FrameView<'_>, force_key: bool) {
        if !self.sink.check() {
            return;
        }
        let force = force_key || self.key_required;
        match self.enc.encode(frame, force, &mut self.dest) {
            Ok(is_key) => {
                let mut key_requested = false;
                if let Err(e) = self.sink.put(self.dest.as_view(), &mut key_requested) {
                    warn!(error = %e, code = e.code(), "video sink put failed");
                    return;
                }
                if key_requested {
                    debug!("sink reader requested a keyframe");
                    self.key_required = true;
                } else if is_key {
                    self.key_required = false;
                }
            }
            Err(e) => warn!(error = %e, code = e.code(), "video encode failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use visor_codec::{EncoderDescriptor, EncoderKind};
    use visor_core::prelude::{FourCc, MemSinkClient, SinkConfig};

    struct FakeVideoEncoder {
        descriptor: EncoderDescriptor,
        forced_keys: std::sync::Arc<parking_lot::Mutex<Vec<bool>>>,
    }

    impl FakeVideoEncoder {
        fn new() -> (Box<Self>, std::sync::Arc<parking_lot::Mutex<Vec<bool>>>) {
            let forced_keys = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
            let enc = Box::new(Self {
                descriptor: EncoderDescriptor {
                    kind: EncoderKind::M2mVideo,
                    input: FourCc::RGB24,
                    output: FourCc::H264,
                    name: "h264",
                    impl_name: "fake",
                },
                forced_keys: forced_keys.clone(),
            });
            (enc, forced_keys)
        }
    }

    impl VideoEncoder for FakeVideoEncoder {
        fn descriptor(&self) -> &EncoderDescriptor {
            &self.descriptor
        }

        fn configure(&mut self, _bitrate_kbps: u32, _gop: u32) -> Result<(), CodecError> {
            Ok(())
        }

        fn encode(
            &mut self,
            src: FrameView<'_>,
            force_key: bool,
            dest: &mut RawFrame,
        ) -> Result<bool, CodecError> {
            self.forced_keys.lock().push(force_key);
            dest.copy_from_view(src);
            dest.format = FourCc::H264;
            Ok(force_key)
        }
    }

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "visor-motion-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn live_frame() -> RawFrame {
        let mut frame = RawFrame::new();
        frame.set_geometry(4, 4, 12, FourCc::RGB24, 30.0);
        frame.online = true;
        frame.assign(&[3u8; 48]);
        frame
    }

    #[test]
    fn reader_key_request_arms_until_keyframe() {
        let mut cfg = SinkConfig::new(unique_name("key"), 4096);
        cfg.idle_interval = 0.0;
        let sink = MemSinkServer::open(&cfg).unwrap();
        let mut client = MemSinkClient::open(&cfg.name).unwrap();
        let (enc, _forced) = FakeVideoEncoder::new();
        let mut motion = MotionStream::new(enc, sink, 5000, 30).unwrap();

        let frame = live_frame();
        motion.process(frame.as_view(), false);
        client.request_key().unwrap();

        // The put that observes the request arms key_required for the NEXT
        // frame.
        motion.process(frame.as_view(), false);
        assert!(motion.key_required);
        motion.process(frame.as_view(), false);
        assert!(!motion.key_required, "keyframe went out, request cleared");

        let got = client
            .wait_frame(Duration::from_millis(200))
            .unwrap()
            .expect("frame");
        assert_eq!(got.format, FourCc::H264);
    }

    #[test]
    fn slowdown_lift_forces_keyframe() {
        let mut cfg = SinkConfig::new(unique_name("force"), 4096);
        cfg.idle_interval = 0.0;
        let sink = MemSinkServer::open(&cfg).unwrap();
        let (enc, forced) = FakeVideoEncoder::new();
        let mut motion = MotionStream::new(enc, sink, 5000, 30).unwrap();

        let frame = live_frame();
        motion.process(frame.as_view(), true);
        assert_eq!(*forced.lock(), vec![true]);
    }
}
