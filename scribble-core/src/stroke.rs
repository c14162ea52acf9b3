//! Stroke value types: points, brush properties and finished strokes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;

use crate::ids::StrokeId;

/// A pointer position in canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Stroke color as a hex code (`#rrggbb`) or a named color.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color(String);

impl Color {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Color {
    fn default() -> Self {
        Self("#000000".to_string())
    }
}

impl From<&str> for Color {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Brush width in pixels. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrokeWidth(NonZeroU32);

impl StrokeWidth {
    /// Returns `None` for a zero width.
    pub fn new(width: u32) -> Option<Self> {
        NonZeroU32::new(width).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl Default for StrokeWidth {
    fn default() -> Self {
        Self(NonZeroU32::MIN)
    }
}

/// A finished, immutable stroke as stored in session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedStroke {
    pub id: StrokeId,
    /// Ordered points. Order matters for rendering.
    pub points: Vec<Point>,
    pub width: StrokeWidth,
    pub color: Color,
}

impl ConnectedStroke {
    pub fn new(id: StrokeId, points: Vec<Point>, width: StrokeWidth, color: Color) -> Self {
        Self {
            id,
            points,
            width,
            color,
        }
    }

    /// A dot rather than a line. Renderers draw these differently.
    pub fn is_single_point(&self) -> bool {
        self.points.len() == 1
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn first_point(&self) -> Option<&Point> {
        self.points.first()
    }

    pub fn last_point(&self) -> Option<&Point> {
        self.points.last()
    }
}
