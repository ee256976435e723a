//! Packed 4-bit-per-pixel board bitmap.
//!
//! Layout:
//! ```text
//!   linear index  i = x + y * W
//!   byte offset   i / 2
//!
//!   ┌────────────┬────────────┐
//!   │ bits 7..4  │ bits 3..0  │   one byte
//!   │ even pixel │ odd pixel  │
//!   └────────────┴────────────┘
//! ```
//!
//! The buffer length is fixed at `ceil(W * H / 2)` for the life of the board.
//! Writing one pixel is a read-modify-write of a byte shared with its
//! neighbour, so a [`Board`] must only be mutated under exclusive access.

use image::{Rgba, RgbaImage};
use thiserror::Error;

use crate::pixel::Pixel;

/// Default board edge length in pixels.
pub const DEFAULT_BOARD_SIZE: u16 = 1000;

const HIGH_NIBBLE: u8 = 0xF0;
const LOW_NIBBLE: u8 = 0x0F;

/// Board codec errors.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("malformed board: expected {expected} bytes, got {actual}")]
    MalformedBoard { expected: usize, actual: usize },
    #[error("pixel ({x}, {y}) is outside the {width}x{height} board")]
    OutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    #[error("failed to decode seed image: {0}")]
    Image(#[from] image::ImageError),
}

/// Board dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoardGeometry {
    pub width: u16,
    pub height: u16,
}

impl BoardGeometry {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    pub const fn square(size: u16) -> Self {
        Self::new(size, size)
    }

    /// Total number of pixels (W * H).
    pub fn pixel_count(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }

    /// Packed buffer length in bytes.
    pub fn packed_len(&self) -> usize {
        self.pixel_count().div_ceil(2)
    }

    pub fn contains(&self, x: u16, y: u16) -> bool {
        x < self.width && y < self.height
    }

    /// Row-major linear index. Caller must check [`contains`](Self::contains).
    pub fn linear_index(&self, x: u16, y: u16) -> usize {
        usize::from(x) + usize::from(y) * usize::from(self.width)
    }

    fn check(&self, x: u16, y: u16) -> Result<usize, BoardError> {
        if !self.contains(x, y) {
            return Err(BoardError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(self.linear_index(x, y))
    }
}

impl Default for BoardGeometry {
    fn default() -> Self {
        Self::square(DEFAULT_BOARD_SIZE)
    }
}

/// Result of folding a batch of pixels into a board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Decode a packed blob into one color byte per pixel.
pub fn unpack(geometry: BoardGeometry, blob: &[u8]) -> Result<Vec<u8>, BoardError> {
    check_len(geometry, blob.len())?;
    Ok(unpack_unchecked(geometry, blob))
}

fn unpack_unchecked(geometry: BoardGeometry, blob: &[u8]) -> Vec<u8> {
    let mut colors = Vec::with_capacity(blob.len() * 2);
    for byte in blob {
        colors.push(byte >> 4);
        colors.push(byte & LOW_NIBBLE);
    }
    // Odd pixel counts leave a padding nibble in the last byte.
    colors.truncate(geometry.pixel_count());
    colors
}

fn check_len(geometry: BoardGeometry, actual: usize) -> Result<(), BoardError> {
    let expected = geometry.packed_len();
    if actual != expected {
        return Err(BoardError::MalformedBoard { expected, actual });
    }
    Ok(())
}

/// The full canvas as a packed bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    geometry: BoardGeometry,
    bitmap: Vec<u8>,
}

impl Board {
    /// Wrap an existing packed blob.
    pub fn from_bytes(geometry: BoardGeometry, bitmap: Vec<u8>) -> Result<Self, BoardError> {
        check_len(geometry, bitmap.len())?;
        Ok(Self { geometry, bitmap })
    }

    /// A board where every pixel has the same color.
    pub fn solid(geometry: BoardGeometry, color: u8) -> Self {
        let c = color & LOW_NIBBLE;
        Self {
            geometry,
            bitmap: vec![(c << 4) | c; geometry.packed_len()],
        }
    }

    /// Build a new board from a fill mode.
    pub fn generate(geometry: BoardGeometry, fill: &FillMode) -> Self {
        match fill {
            FillMode::Solid(color) => Self::solid(geometry, *color),
            FillMode::Image(seed) => seed.rasterize(geometry),
        }
    }

    /// Pack one color per pixel (inverse of [`unpack`](Self::unpack)).
    ///
    /// Colors are taken mod 16.
    pub fn pack(geometry: BoardGeometry, colors: &[u8]) -> Result<Self, BoardError> {
        if colors.len() != geometry.pixel_count() {
            return Err(BoardError::MalformedBoard {
                expected: geometry.pixel_count(),
                actual: colors.len(),
            });
        }
        let bitmap = colors
            .chunks(2)
            .map(|pair| {
                let high = (pair[0] & LOW_NIBBLE) << 4;
                let low = pair.get(1).map_or(0, |c| c & LOW_NIBBLE);
                high | low
            })
            .collect();
        Ok(Self { geometry, bitmap })
    }

    /// Write one pixel in place, preserving the neighbour sharing its byte.
    pub fn insert_pixel(&mut self, x: u16, y: u16, color: u8) -> Result<(), BoardError> {
        let index = self.geometry.check(x, y)?;
        let color = color & LOW_NIBBLE;
        let byte = &mut self.bitmap[index / 2];
        *byte = if index % 2 == 0 {
            (*byte & LOW_NIBBLE) | (color << 4)
        } else {
            (*byte & HIGH_NIBBLE) | color
        };
        Ok(())
    }

    pub fn apply(&mut self, pixel: &Pixel) -> Result<(), BoardError> {
        self.insert_pixel(pixel.x, pixel.y, pixel.color)
    }

    /// Fold pixels in order; out-of-bounds pixels are skipped and counted.
    pub fn apply_all<'a, I>(&mut self, pixels: I) -> ApplyReport
    where
        I: IntoIterator<Item = &'a Pixel>,
    {
        let mut report = ApplyReport::default();
        for pixel in pixels {
            match self.apply(pixel) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    log::warn!("Skipping pixel: {e}");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    pub fn color_at(&self, x: u16, y: u16) -> Result<u8, BoardError> {
        let index = self.geometry.check(x, y)?;
        let byte = self.bitmap[index / 2];
        Ok(if index % 2 == 0 { byte >> 4 } else { byte & LOW_NIBBLE })
    }

    /// One color byte (0-15) per pixel, row-major.
    pub fn unpack(&self) -> Vec<u8> {
        unpack_unchecked(self.geometry, &self.bitmap)
    }

    pub fn geometry(&self) -> BoardGeometry {
        self.geometry
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bitmap
    }
}

/// How a fresh board is populated.
pub enum FillMode {
    Solid(u8),
    Image(ImageSeed),
}

/// Maps a source pixel to a palette index when its predicate matches.
pub struct PaletteRule {
    index: u8,
    matcher: Box<dyn Fn(&Rgba<u8>) -> bool + Send + Sync>,
}

impl PaletteRule {
    pub fn new(index: u8, matcher: impl Fn(&Rgba<u8>) -> bool + Send + Sync + 'static) -> Self {
        Self {
            index,
            matcher: Box::new(matcher),
        }
    }

    /// Match one exact RGBA value.
    pub fn exact(index: u8, rgba: [u8; 4]) -> Self {
        Self::new(index, move |p| p.0 == rgba)
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    fn matches(&self, pixel: &Rgba<u8>) -> bool {
        (self.matcher)(pixel)
    }
}

/// A source image rasterized onto the board at an offset.
///
/// Every board pixel starts as `background`; image pixels take the index of
/// the first rule that matches them and are left as background otherwise.
pub struct ImageSeed {
    pub image: RgbaImage,
    pub offset: (u16, u16),
    pub background: u8,
    pub rules: Vec<PaletteRule>,
}

impl ImageSeed {
    pub fn new(image: RgbaImage, background: u8) -> Self {
        Self {
            image,
            offset: (0, 0),
            background,
            rules: Vec::new(),
        }
    }

    /// Decode an encoded image (PNG).
    pub fn decode(bytes: &[u8], background: u8) -> Result<Self, BoardError> {
        let image = image::load_from_memory(bytes)?.to_rgba8();
        Ok(Self::new(image, background))
    }

    pub fn with_offset(mut self, x: u16, y: u16) -> Self {
        self.offset = (x, y);
        self
    }

    pub fn with_rule(mut self, rule: PaletteRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn rasterize(&self, geometry: BoardGeometry) -> Board {
        let mut board = Board::solid(geometry, self.background);
        for (sx, sy, source) in self.image.enumerate_pixels() {
            let Some(rule) = self.rules.iter().find(|r| r.matches(source)) else {
                continue;
            };
            let tx = u32::from(self.offset.0) + sx;
            let ty = u32::from(self.offset.1) + sy;
            let (Ok(x), Ok(y)) = (u16::try_from(tx), u16::try_from(ty)) else {
                continue;
            };
            if geometry.contains(x, y) {
                // In bounds by the check above.
                let _ = board.insert_pixel(x, y, rule.index);
            }
        }
        board
    }
}
