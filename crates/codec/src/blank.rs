use tracing::warn;

use visor_core::prelude::RawFrame;

use crate::frametext::FrameText;
use crate::jpeg::MozjpegEncoder;
use crate::StillEncoder;

const BLANK_QUALITY: i32 = 75;

/// Pre-rendered placeholder shown when no live capture is available: a raw
/// RGB24 frame and its JPEG encoding, kept in sync and redrawn only when the
/// message or geometry changes.
///
/// # Example
/// ```rust
/// use visor_codec::blank::Blank;
///
/// let mut blank = Blank::new();
/// blank.draw("< NO SIGNAL >", 320, 240);
/// assert_eq!(&blank.jpeg().payload()[..2], &[0xFF, 0xD8]);
/// assert!(!blank.jpeg().online);
/// ```
pub struct Blank {
    ft: FrameText,
    enc: MozjpegEncoder,
    raw: RawFrame,
    jpeg: RawFrame,
    drawn: Option<(String, u32, u32)>,
}

impl Default for Blank {
    fn default() -> Self {
        Self::new()
    }
}

impl Blank {
    pub fn new() -> Self {
        Self {
            ft: FrameText::new(),
            enc: MozjpegEncoder::new(BLANK_QUALITY),
            raw: RawFrame::new(),
            jpeg: RawFrame::new(),
            drawn: None,
        }
    }

    /// Render `text` at the given geometry. Zero dimensions fall back to VGA
    /// so a blank exists before the first successful device open.
    pub fn draw(&mut self, text: &str, width: u32, height: u32) {
        let width = if width == 0 { 640 } else { width };
        let height = if height == 0 { 480 } else { height };
        if self
            .drawn
            .as_ref()
            .is_some_and(|(t, w, h)| t == text && *w == width && *h == height)
        {
            return;
        }
        self.raw.copy_from(self.ft.draw(text, width, height));
        self.raw.online = false;
        if let Err(e) = self.enc.encode(self.raw.as_view(), &mut self.jpeg) {
            warn!(error = %e, "blank jpeg render failed, keeping previous");
            return;
        }
        self.jpeg.online = false;
        self.drawn = Some((text.to_string(), width, height));
    }

    /// The raw RGB24 blank.
    pub fn raw(&self) -> &RawFrame {
        &self.raw
    }

    /// The JPEG-encoded blank.
    pub fn jpeg(&self) -> &RawFrame {
        &self.jpeg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_geometry_falls_back_to_vga() {
        let mut blank = Blank::new();
        blank.draw("< NO SIGNAL >", 0, 0);
        assert_eq!(blank.raw().width, 640);
        assert_eq!(blank.raw().height, 480);
        assert_eq!(&blank.jpeg().payload()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn redraw_skipped_when_unchanged() {
        let mut blank = Blank::new();
        blank.draw("< NO SIGNAL >", 320, 240);
        let first = blank.jpeg().payload().to_vec();
        blank.draw("< NO SIGNAL >", 320, 240);
        assert_eq!(blank.jpeg().payload(), &first[..]);
        blank.draw("< NO SIGNAL >", 640, 480);
        assert_eq!(blank.raw().width, 640);
    }
}
