use visor_core::prelude::{FourCc, RawFrame};

const GLYPH_W: u32 = 8;
const GLYPH_H: u32 = 8;
const FOREGROUND: [u8; 3] = [0xCC, 0xCC, 0xCC];

// 8x8 console glyphs, one row per byte, MSB is the leftmost pixel. Input is
// uppercased before lookup; anything without a glyph renders as '?'.
const GLYPHS: &[(u8, [u8; 8])] = &[
    (b'A', [0x18, 0x3C, 0x66, 0x66, 0x7E, 0x66, 0x66, 0x00]),
    (b'B', [0x7C, 0x66, 0x66, 0x7C, 0x66, 0x66, 0x7C, 0x00]),
    (b'C', [0x3C, 0x66, 0x60, 0x60, 0x60, 0x66, 0x3C, 0x00]),
    (b'D', [0x78, 0x6C, 0x66, 0x66, 0x66, 0x6C, 0x78, 0x00]),
    (b'E', [0x7E, 0x60, 0x60, 0x7C, 0x60, 0x60, 0x7E, 0x00]),
    (b'F', [0x7E, 0x60, 0x60, 0x7C, 0x60, 0x60, 0x60, 0x00]),
    (b'G', [0x3C, 0x66, 0x60, 0x6E, 0x66, 0x66, 0x3E, 0x00]),
    (b'H', [0x66, 0x66, 0x66, 0x7E, 0x66, 0x66, 0x66, 0x00]),
    (b'I', [0x3C, 0x18, 0x18, 0x18, 0x18, 0x18, 0x3C, 0x00]),
    (b'J', [0x1E, 0x0C, 0x0C, 0x0C, 0x0C, 0x6C, 0x38, 0x00]),
    (b'K', [0x66, 0x6C, 0x78, 0x70, 0x78, 0x6C, 0x66, 0x00]),
    (b'L', [0x60, 0x60, 0x60, 0x60, 0x60, 0x60, 0x7E, 0x00]),
    (b'M', [0x63, 0x77, 0x7F, 0x6B, 0x63, 0x63, 0x63, 0x00]),
    (b'N', [0x66, 0x76, 0x7E, 0x7E, 0x6E, 0x66, 0x66, 0x00]),
    (b'O', [0x3C, 0x66, 0x66, 0x66, 0x66, 0x66, 0x3C, 0x00]),
    (b'P', [0x7C, 0x66, 0x66, 0x7C, 0x60, 0x60, 0x60, 0x00]),
    (b'Q', [0x3C, 0x66, 0x66, 0x66, 0x66, 0x6C, 0x36, 0x00]),
    (b'R', [0x7C, 0x66, 0x66, 0x7C, 0x78, 0x6C, 0x66, 0x00]),
    (b'S', [0x3C, 0x66, 0x60, 0x3C, 0x06, 0x66, 0x3C, 0x00]),
    (b'T', [0x7E, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x00]),
    (b'U', [0x66, 0x66, 0x66, 0x66, 0x66, 0x66, 0x3C, 0x00]),
    (b'V', [0x66, 0x66, 0x66, 0x66, 0x66, 0x3C, 0x18, 0x00]),
    (b'W', [0x63, 0x63, 0x63, 0x6B, 0x7F, 0x77, 0x63, 0x00]),
    (b'X', [0x66, 0x66, 0x3C, 0x18, 0x3C, 0x66, 0x66, 0x00]),
    (b'Y', [0x66, 0x66, 0x66, 0x3C, 0x18, 0x18, 0x18, 0x00]),
    (b'Z', [0x7E, 0x06, 0x0C, 0x18, 0x30, 0x60, 0x7E, 0x00]),
    (b'0', [0x3C, 0x66, 0x6E, 0x76, 0x66, 0x66, 0x3C, 0x00]),
    (b'1', [0x18, 0x38, 0x18, 0x18, 0x18, 0x18, 0x7E, 0x00]),
    (b'2', [0x3C, 0x66, 0x06, 0x0C, 0x30, 0x60, 0x7E, 0x00]),
    (b'3', [0x3C, 0x66, 0x06, 0x1C, 0x06, 0x66, 0x3C, 0x00]),
    (b'4', [0x0C, 0x1C, 0x3C, 0x6C, 0x7E, 0x0C, 0x0C, 0x00]),
    (b'5', [0x7E, 0x60, 0x7C, 0x06, 0x06, 0x66, 0x3C, 0x00]),
    (b'6', [0x3C, 0x66, 0x60, 0x7C, 0x66, 0x66, 0x3C, 0x00]),
    (b'7', [0x7E, 0x06, 0x0C, 0x18, 0x30, 0x30, 0x30, 0x00]),
    (b'8', [0x3C, 0x66, 0x66, 0x3C, 0x66, 0x66, 0x3C, 0x00]),
    (b'9', [0x3C, 0x66, 0x66, 0x3E, 0x06, 0x66, 0x3C, 0x00]),
    (b' ', [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
    (b'<', [0x0E, 0x18, 0x30, 0x60, 0x30, 0x18, 0x0E, 0x00]),
    (b'>', [0x70, 0x18, 0x0C, 0x06, 0x0C, 0x18, 0x70, 0x00]),
    (b'=', [0x00, 0x00, 0x7E, 0x00, 0x7E, 0x00, 0x00, 0x00]),
    (b'-', [0x00, 0x00, 0x00, 0x7E, 0x00, 0x00, 0x00, 0x00]),
    (b'.', [0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00]),
    (b':', [0x00, 0x18, 0x18, 0x00, 0x18, 0x18, 0x00, 0x00]),
    (b'/', [0x02, 0x06, 0x0C, 0x18, 0x30, 0x60, 0x40, 0x00]),
    (b'?', [0x3C, 0x66, 0x06, 0x0C, 0x18, 0x00, 0x18, 0x00]),
    (b'_', [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x7E]),
    (b'!', [0x18, 0x18, 0x18, 0x18, 0x18, 0x00, 0x18, 0x00]),
];

fn glyph_for(ch: u8) -> &'static [u8; 8] {
    let ch = ch.to_ascii_uppercase();
    GLYPHS
        .iter()
        .find(|(g, _)| *g == ch)
        .or_else(|| GLYPHS.iter().find(|(g, _)| *g == b'?'))
        .map(|(_, rows)| rows)
        .unwrap_or(&[0u8; 8])
}

/// Renders multi-line messages into an RGB24 frame for stub screens.
///
/// The rasterizer owns its frame and reuses the allocation across draws; the
/// text block is integer-scaled to roughly a third of the display width and
/// centered.
///
/// # Example
/// ```rust
/// use visor_codec::frametext::FrameText;
///
/// let mut ft = FrameText::new();
/// let frame = ft.draw("NO SIGNAL", 320, 240);
/// assert_eq!(frame.width, 320);
/// assert!(frame.payload().iter().any(|b| *b != 0));
/// ```
pub struct FrameText {
    frame: RawFrame,
}

impl Default for FrameText {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameText {
    pub fn new() -> Self {
        Self {
            frame: RawFrame::new(),
        }
    }

    /// Rasterize `text` centered into a `width`x`height` RGB24 frame.
    pub fn draw(&mut self, text: &str, width: u32, height: u32) -> &RawFrame {
        let width = width.max(GLYPH_W);
        let height = height.max(GLYPH_H);
        let stride = width * 3;
        self.frame
            .set_geometry(width, height, stride, FourCc::RGB24, 0.0);
        self.frame.online = false;

        let lines: Vec<&str> = text.lines().collect();
        let max_cols = lines.iter().map(|l| l.len()).max().unwrap_or(0) as u32;
        {
            let payload = self.frame.payload_mut((stride * height) as usize);
            payload.fill(0);

            if max_cols > 0 {
                // Target about a third of the display for the text block.
                let scale_w = (width / 3) / (max_cols * GLYPH_W);
                let scale_h = (height / 3) / (lines.len() as u32 * GLYPH_H);
                let scale = scale_w.min(scale_h).max(1);

                let block_h = lines.len() as u32 * GLYPH_H * scale;
                let top = height.saturating_sub(block_h) / 2;

                for (li, line) in lines.iter().enumerate() {
                    let line_w = line.len() as u32 * GLYPH_W * scale;
                    let left = width.saturating_sub(line_w) / 2;
                    let y0 = top + li as u32 * GLYPH_H * scale;
                    for (ci, ch) in line.bytes().enumerate() {
                        let rows = glyph_for(ch);
                        let x0 = left + ci as u32 * GLYPH_W * scale;
                        draw_glyph(payload, stride, width, height, rows, x0, y0, scale);
                    }
                }
            }
        }
        &self.frame
    }
}

fn draw_glyph(
    payload: &mut [u8],
    stride: u32,
    width: u32,
    height: u32,
    rows: &[u8; 8],
    x0: u32,
    y0: u32,
    scale: u32,
) {
    for (ry, row) in rows.iter().enumerate() {
        for rx in 0..GLYPH_W {
            if row & (0x80 >> rx) == 0 {
                continue;
            }
            for sy in 0..scale {
                for sx in 0..scale {
                    let x = x0 + rx * scale + sx;
                    let y = y0 + ry as u32 * scale + sy;
                    if x >= width || y >= height {
                        continue;
                    }
                    let off = (y * stride + x * 3) as usize;
                    payload[off..off + 3].copy_from_slice(&FOREGROUND);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_within_bounds() {
        let mut ft = FrameText::new();
        let frame = ft.draw("NO SIGNAL", 160, 120);
        assert_eq!(frame.used(), 160 * 120 * 3);
        assert!(!frame.online);
        assert!(frame.payload().iter().any(|b| *b != 0));
    }

    #[test]
    fn caption_characters_all_have_glyphs() {
        let captions = [
            "UNSUPPORTED RESOLUTION",
            "UNSUPPORTED CAPTURE FORMAT",
            "NO SIGNAL",
            "ONLINE IS ACTIVE",
            "1920x1080p60.00",
            "HTTPS://GITHUB.COM/VISOR-KVM/VISOR",
        ];
        let fallback = glyph_for(b'?');
        for caption in captions {
            for ch in caption.bytes().filter(|c| *c != b'?') {
                assert_ne!(
                    glyph_for(ch),
                    fallback,
                    "missing glyph for {:?}",
                    ch as char
                );
            }
        }
    }

    #[test]
    fn multiline_text_stacks() {
        let mut ft = FrameText::new();
        let one = ft.draw("AA", 64, 64).payload().to_vec();
        let lit_one = one.iter().filter(|b| **b != 0).count();
        let two = ft.draw("AA\nAA", 64, 64).payload().to_vec();
        let lit_two = two.iter().filter(|b| **b != 0).count();
        assert!(lit_two > lit_one);
    }
}
