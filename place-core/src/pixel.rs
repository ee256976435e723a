//! Pixel writes as they arrive from clients and as they are stored in the log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::BoardGeometry;

/// Milliseconds since the Unix epoch.
///
/// Signed so that "far in the past" seeds (see [`crate::throttle::UserState::new`])
/// stay representable near the epoch.
pub type TimestampMs = i64;

/// Number of distinct palette entries (4 bits per pixel).
pub const PALETTE_SIZE: u8 = 16;

/// An accepted pixel write.
///
/// Immutable once appended to the change log. Multiple writes to the same
/// (x, y) are ordered by log sequence number; the last one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pixel {
    pub x: u16,
    pub y: u16,
    /// Palette index in [0, 15]
    pub color: u8,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub last_updated: TimestampMs,
}

impl Pixel {
    pub fn new(x: u16, y: u16, color: u8) -> Self {
        Self {
            x,
            y,
            color,
            user_id: String::new(),
            last_updated: 0,
        }
    }

    /// Tag the pixel with its author and acceptance time.
    pub fn authored(mut self, user_id: impl Into<String>, at: TimestampMs) -> Self {
        self.user_id = user_id.into();
        self.last_updated = at;
        self
    }
}

/// One element of a pixel submission body: `{"x": .., "y": .., "color": ..}`.
///
/// Fields are signed so that negative coordinates reach validation instead of
/// failing JSON decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelWrite {
    pub x: i64,
    pub y: i64,
    pub color: i64,
}

impl PixelWrite {
    pub fn new(x: i64, y: i64, color: i64) -> Self {
        Self { x, y, color }
    }

    /// Check bounds and palette range, producing an untagged [`Pixel`].
    pub fn validate(&self, geometry: BoardGeometry) -> Result<Pixel, ValidationError> {
        let in_x = self.x >= 0 && self.x < i64::from(geometry.width);
        let in_y = self.y >= 0 && self.y < i64::from(geometry.height);
        if !in_x || !in_y {
            return Err(ValidationError::OutOfBounds {
                x: self.x,
                y: self.y,
                width: geometry.width,
                height: geometry.height,
            });
        }
        if !(0..i64::from(PALETTE_SIZE)).contains(&self.color) {
            return Err(ValidationError::InvalidColor { color: self.color });
        }
        Ok(Pixel::new(self.x as u16, self.y as u16, self.color as u8))
    }
}

/// Validate a whole submission. Fails on the first bad pixel.
pub fn validate_batch(
    writes: &[PixelWrite],
    geometry: BoardGeometry,
) -> Result<Vec<Pixel>, ValidationError> {
    if writes.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    writes.iter().map(|w| w.validate(geometry)).collect()
}

/// A submission that can never be accepted as written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pixel batch is empty")]
    EmptyBatch,
    #[error("pixel ({x}, {y}) is outside the {width}x{height} board")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u16,
        height: u16,
    },
    #[error("color {color} is outside the palette [0, 15]")]
    InvalidColor { color: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_json_field_names() {
        let pixel = Pixel::new(3, 4, 7).authored("alice", 1_000);
        let json = serde_json::to_value(&pixel).unwrap();
        assert_eq!(json["x"], 3);
        assert_eq!(json["y"], 4);
        assert_eq!(json["color"], 7);
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["lastUpdated"], 1_000);
    }

    #[test]
    fn test_pixel_optional_fields_default() {
        let pixel: Pixel = serde_json::from_str(r#"{"x":1,"y":2,"color":3}"#).unwrap();
        assert_eq!(pixel, Pixel::new(1, 2, 3));
        assert!(pixel.user_id.is_empty());
    }

    #[test]
    fn test_validate_in_bounds() {
        let geometry = BoardGeometry::new(4, 4);
        let pixel = PixelWrite::new(3, 3, 15).validate(geometry).unwrap();
        assert_eq!(pixel, Pixel::new(3, 3, 15));
    }

    #[test]
    fn test_validate_out_of_bounds() {
        let geometry = BoardGeometry::new(4, 4);
        for (x, y) in [(4, 0), (0, 4), (-1, 0), (0, -1)] {
            let err = PixelWrite::new(x, y, 1).validate(geometry).unwrap_err();
            assert!(matches!(err, ValidationError::OutOfBounds { .. }), "({x}, {y})");
        }
    }

    #[test]
    fn test_validate_color_range() {
        let geometry = BoardGeometry::new(4, 4);
        assert_eq!(
            PixelWrite::new(0, 0, 16).validate(geometry),
            Err(ValidationError::InvalidColor { color: 16 })
        );
        assert!(PixelWrite::new(0, 0, -1).validate(geometry).is_err());
    }

    #[test]
    fn test_validate_batch_rejects_empty() {
        let geometry = BoardGeometry::new(4, 4);
        assert_eq!(validate_batch(&[], geometry), Err(ValidationError::EmptyBatch));
    }

    #[test]
    fn test_submission_body_decodes() {
        let body = r#"[{"x":1,"y":2,"color":3},{"x":0,"y":0,"color":15}]"#;
        let writes: Vec<PixelWrite> = serde_json::from_str(body).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], PixelWrite::new(0, 0, 15));
    }
}
