//! Pattern thumbnail rendering: one pixel per step, white where a step has
//! subnotes, gray for empty steps inside the playable bars, black outside.

use crate::sequencer::pattern::Pattern;

const WHITE: [u8; 4] = [255, 255, 255, 255];
const GRAY: [u8; 4] = [128, 128, 128, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

/// A packed RGBA image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<[u8; 4]>,
}

/// Split an `image://pattern/...` id into (sequence name, pattern index,
/// bank index)
pub fn parse_image_id(id: &str) -> Option<(&str, usize, usize)> {
    let mut parts = id.split('/');
    let sequence = parts.next()?;
    let pattern: usize = parts.next()?.parse().ok()?;
    let bank: usize = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((sequence, pattern, bank))
}

/// Render one bank of a pattern as a 1-pixel-tall strip.
///
/// Rows concatenate left to right, each `pattern.width()` pixels of a row
/// followed by the next row, for a total width of
/// `pattern.width() * pattern.bank_length()`.
pub fn render_strip(pattern: &Pattern, bank: usize) -> PatternImage {
    let width = pattern.width() * pattern.bank_length();
    let mut pixels = Vec::with_capacity(width);
    for row_in_bank in 0..pattern.bank_length() {
        for column in 0..pattern.width() {
            let color = if row_in_bank < pattern.available_bars() {
                let has_notes = pattern
                    .cell(bank * pattern.bank_length() + row_in_bank, column)
                    .map(|cell| !cell.is_empty())
                    .unwrap_or(false);
                if has_notes {
                    WHITE
                } else {
                    GRAY
                }
            } else {
                BLACK
            };
            pixels.push(color);
        }
    }
    PatternImage {
        width,
        height: 1,
        pixels,
    }
}

/// Scale to a requested size, ignoring aspect ratio, with box averaging
/// (the "smooth" transform for a strip this coarse).
pub fn scale(image: &PatternImage, width: usize, height: usize) -> PatternImage {
    if width == 0 || height == 0 || image.width == 0 || image.height == 0 {
        return PatternImage {
            width,
            height,
            pixels: vec![BLACK; width * height],
        };
    }
    let mut pixels = Vec::with_capacity(width * height);
    for y in 0..height {
        let y0 = y * image.height / height;
        let y1 = (((y + 1) * image.height).div_ceil(height)).max(y0 + 1);
        for x in 0..width {
            let x0 = x * image.width / width;
            let x1 = (((x + 1) * image.width).div_ceil(width)).max(x0 + 1);
            let mut sum = [0u32; 4];
            let mut count = 0u32;
            for sy in y0..y1.min(image.height) {
                for sx in x0..x1.min(image.width) {
                    let pixel = image.pixels[sy * image.width + sx];
                    for (total, component) in sum.iter_mut().zip(pixel) {
                        *total += component as u32;
                    }
                    count += 1;
                }
            }
            let mut pixel = [0u8; 4];
            for (component, total) in pixel.iter_mut().zip(sum) {
                *component = (total / count.max(1)) as u8;
            }
            pixels.push(pixel);
        }
    }
    PatternImage {
        width,
        height,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::note::NoteRegistry;

    #[test]
    fn image_id_parsing() {
        assert_eq!(parse_image_id("T1/2/0"), Some(("T1", 2, 0)));
        assert_eq!(parse_image_id("T1/2"), None);
        assert_eq!(parse_image_id("T1/x/0"), None);
    }

    #[test]
    fn strip_colours_follow_cell_contents() {
        let mut registry = NoteRegistry::new();
        let mut pattern = Pattern::new("test");
        pattern.set_midi_channel(&mut registry, 0);
        let note = registry.note(60, 0).unwrap();
        pattern.add_subnote(&mut registry, 0, 2, note);
        pattern.set_available_bars(1);

        let strip = render_strip(&pattern, 0);
        assert_eq!(strip.width, 16 * 8);
        assert_eq!(strip.height, 1);
        assert_eq!(strip.pixels[2], WHITE);
        assert_eq!(strip.pixels[0], GRAY);
        // Second row of the bank sits outside the single available bar
        assert_eq!(strip.pixels[16], BLACK);
    }

    #[test]
    fn scaling_ignores_aspect_and_averages() {
        let image = PatternImage {
            width: 2,
            height: 1,
            pixels: vec![WHITE, BLACK],
        };
        let scaled = scale(&image, 1, 2);
        assert_eq!(scaled.width, 1);
        assert_eq!(scaled.height, 2);
        // Both rows hold the average of white and black
        assert_eq!(scaled.pixels[0][0], 127);
        assert_eq!(scaled.pixels[0], scaled.pixels[1]);
    }
}
