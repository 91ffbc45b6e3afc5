#![doc = include_str!("../README.md")]

use visor_core::prelude::{FourCc, FrameView, RawFrame};

pub mod blank;
pub mod frametext;
pub mod jpeg;

/// How an encoder reaches its hardware, which decides whether capture
/// buffers must be exported as DMA descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// Plain software encoder fed from mapped memory.
    Cpu,
    /// Memory-to-memory still-image hardware.
    M2mImage,
    /// Memory-to-memory video hardware.
    M2mVideo,
}

impl EncoderKind {
    /// True when the encoder consumes DMA-BUF descriptors.
    pub fn wants_dma(&self) -> bool {
        matches!(self, EncoderKind::M2mImage | EncoderKind::M2mVideo)
    }
}

/// Descriptor for an encoder implementation.
///
/// # Example
/// ```rust
/// use visor_codec::{EncoderDescriptor, EncoderKind};
/// use visor_core::prelude::FourCc;
///
/// let desc = EncoderDescriptor {
///     kind: EncoderKind::Cpu,
///     input: FourCc::RGB24,
///     output: FourCc::JPEG,
///     name: "jpeg",
///     impl_name: "mozjpeg",
/// };
/// assert_eq!(desc.name, "jpeg");
/// ```
#[derive(Debug, Clone)]
pub struct EncoderDescriptor {
    /// Hardware class of the implementation.
    pub kind: EncoderKind,
    /// Expected input FourCc.
    pub input: FourCc,
    /// Output FourCc produced.
    pub output: FourCc,
    /// Algorithm family (e.g. "jpeg", "h264").
    pub name: &'static str,
    /// Implementation/backend identifier.
    pub impl_name: &'static str,
}

/// Errors emitted by encoders.
///
/// # Example
/// ```rust
/// use visor_codec::CodecError;
/// use visor_core::prelude::FourCc;
///
/// let err = CodecError::FormatMismatch {
///     expected: FourCc::RGB24,
///     actual: FourCc::YUYV,
/// };
/// assert!(matches!(err, CodecError::FormatMismatch { .. }));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input did not match the expected FourCc.
    #[error("format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        /// Expected input FourCc.
        expected: FourCc,
        /// Actual FourCc encountered.
        actual: FourCc,
    },
    /// Frame geometry the encoder cannot handle.
    #[error("bad frame geometry: {0}")]
    Geometry(String),
    /// Backend-specific failure detail.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CodecError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::FormatMismatch { .. } => "format_mismatch",
            CodecError::Geometry(_) => "bad_geometry",
            CodecError::Codec(_) => "codec_error",
        }
    }

    /// Whether the error may succeed when retried. Backend hiccups can pass
    /// on the next frame; a wrong format or geometry will not change until
    /// the device is renegotiated.
    pub fn retryable(&self) -> bool {
        matches!(self, CodecError::Codec(_))
    }
}

/// Still-image encoder driven by the worker pool.
///
/// Implementations are called concurrently from several workers and must not
/// keep per-call state on `self`.
pub trait StillEncoder: Send + Sync + 'static {
    /// Describes what this encoder expects and produces.
    fn descriptor(&self) -> &EncoderDescriptor;

    /// Encode one frame into `dest`, replacing its payload and metadata.
    fn encode(&self, src: FrameView<'_>, dest: &mut RawFrame) -> Result<(), CodecError>;
}

/// Motion-video encoder fed raw frames in grab order with a force-keyframe
/// hint. Returns whether the produced packet is a keyframe.
pub trait VideoEncoder: Send + 'static {
    /// Describes what this encoder expects and produces.
    fn descriptor(&self) -> &EncoderDescriptor;

    /// Encoder bitrate/GOP knobs, applied before the next packet.
    fn configure(&mut self, bitrate_kbps: u32, gop: u32) -> Result<(), CodecError>;

    /// Encode one frame into `dest`.
    fn encode(
        &mut self,
        src: FrameView<'_>,
        force_key: bool,
        dest: &mut RawFrame,
    ) -> Result<bool, CodecError>;
}

pub mod prelude {
    pub use crate::blank::Blank;
    pub use crate::frametext::FrameText;
    pub use crate::jpeg::MozjpegEncoder;
    pub use crate::{CodecError, EncoderDescriptor, EncoderKind, StillEncoder, VideoEncoder};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let mismatch = CodecError::FormatMismatch {
            expected: FourCc::RGB24,
            actual: FourCc::YUYV,
        };
        assert_eq!(mismatch.code(), "format_mismatch");
        assert!(!mismatch.retryable());
        assert!(CodecError::Codec("backend hiccup".into()).retryable());
    }

    #[test]
    fn only_m2m_kinds_want_dma() {
        assert!(!EncoderKind::Cpu.wants_dma());
        assert!(EncoderKind::M2mImage.wants_dma());
        assert!(EncoderKind::M2mVideo.wants_dma());
    }
}
