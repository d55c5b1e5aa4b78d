//! 2D Position
//!
//! Floating-point world coordinates exchanged with clients.
//! The server never simulates movement, it only stores and relays
//! whatever the owning client last reported.

use std::fmt;
use serde::{Serialize, Deserialize};

/// A point on the office floor, in tile units.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate
    pub x: f32,
    /// Y coordinate
    pub y: f32,
}

impl Position {
    /// Where freshly authenticated players appear unless they sent
    /// a `position-init` beforehand.
    pub const SPAWN: Self = Self { x: 6.0, y: 5.0 };

    /// Create a new position.
    #[inline]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Both coordinates are finite numbers.
    #[inline]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zero() {
        assert_eq!(Position::default(), Position::new(0.0, 0.0));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(Position::new(1.0, 2.5)).unwrap();
        assert_eq!(json, serde_json::json!({ "x": 1.0, "y": 2.5 }));
    }

    #[test]
    fn test_integer_coordinates_accepted() {
        // Browser clients send whole tiles as JSON integers.
        let pos: Position = serde_json::from_str(r#"{"x":6,"y":5}"#).unwrap();
        assert_eq!(pos, Position::SPAWN);
    }

    #[test]
    fn test_non_finite_detected() {
        assert!(Position::SPAWN.is_finite());
        assert!(!Position::new(f32::NAN, 0.0).is_finite());
        assert!(!Position::new(0.0, f32::INFINITY).is_finite());
    }
}
