use visor_core::prelude::{FourCc, FrameView, RawFrame};

use crate::{CodecError, EncoderDescriptor, EncoderKind, StillEncoder};

/// JPEG still encoder using mozjpeg, fed packed RGB24.
pub struct MozjpegEncoder {
    descriptor: EncoderDescriptor,
    quality: i32,
}

impl MozjpegEncoder {
    pub fn new(quality: i32) -> Self {
        Self {
            descriptor: EncoderDescriptor {
                kind: EncoderKind::Cpu,
                input: FourCc::RGB24,
                output: FourCc::JPEG,
                name: "jpeg",
                impl_name: "mozjpeg",
            },
            quality: quality.clamp(1, 100),
        }
    }
}

impl StillEncoder for MozjpegEncoder {
    fn descriptor(&self) -> &EncoderDescriptor {
        &self.descriptor
    }

    fn encode(&self, src: FrameView<'_>, dest: &mut RawFrame) -> Result<(), CodecError> {
        if src.format != self.descriptor.input {
            return Err(CodecError::FormatMismatch {
                expected: self.descriptor.input,
                actual: src.format,
            });
        }
        let width = src.width as usize;
        let height = src.height as usize;
        let stride = (src.stride as usize).max(width * 3);
        if width == 0 || height == 0 || src.payload.len() < stride * (height - 1) + width * 3 {
            return Err(CodecError::Geometry(format!(
                "{}x{} stride {} over {} bytes",
                width,
                height,
                stride,
                src.payload.len()
            )));
        }

        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width, height);
        comp.set_quality(self.quality as f32);
        let mut started = comp
            .start_compress(Vec::new())
            .map_err(|e| CodecError::Codec(e.to_string()))?;
        for y in 0..height {
            let line = &src.payload[y * stride..];
            started
                .write_scanlines(&line[..width * 3])
                .map_err(|e| CodecError::Codec(e.to_string()))?;
        }
        let jpeg = started
            .finish()
            .map_err(|e| CodecError::Codec(e.to_string()))?;

        dest.set_geometry(src.width, src.height, 0, self.descriptor.output, src.hz);
        dest.grab_ts = src.grab_ts;
        dest.sequence = src.sequence;
        dest.online = src.online;
        dest.assign(&jpeg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(width: u32, height: u32) -> RawFrame {
        let mut frame = RawFrame::new();
        frame.set_geometry(width, height, width * 3, FourCc::RGB24, 30.0);
        frame.online = true;
        let len = (width * height * 3) as usize;
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        frame.assign(&bytes);
        frame
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let enc = MozjpegEncoder::new(80);
        let src = rgb_frame(32, 16);
        let mut dest = RawFrame::new();
        enc.encode(src.as_view(), &mut dest).expect("encode");
        assert_eq!(&dest.payload()[..2], &[0xFF, 0xD8]);
        assert_eq!(dest.format, FourCc::JPEG);
        assert!(dest.online);
        assert_eq!(dest.width, 32);
    }

    #[test]
    fn rejects_wrong_format() {
        let enc = MozjpegEncoder::new(80);
        let mut src = rgb_frame(8, 8);
        src.format = FourCc::YUYV;
        let mut dest = RawFrame::new();
        assert!(matches!(
            enc.encode(src.as_view(), &mut dest),
            Err(CodecError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn rejects_short_payload() {
        let enc = MozjpegEncoder::new(80);
        let mut src = rgb_frame(8, 8);
        src.assign(&[0u8; 16]);
        let mut dest = RawFrame::new();
        assert!(matches!(
            enc.encode(src.as_view(), &mut dest),
            Err(CodecError::Geometry(_))
        ));
    }
}
