//! Positions, ranges and locations in source text.
//!
//! Shapes match the wire format exactly, so these types serialize straight
//! into request params and deserialize straight out of responses.

use serde::{Deserialize, Serialize};

/// Zero-based `(line, character)` coordinate.
///
/// Ordering is lexicographic: line first, then character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Span between two positions.
///
/// `start <= end` is assumed by every consumer but not enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Whether `position` lies within the range, both ends inclusive.
    #[must_use]
    pub fn contains(&self, position: Position) -> bool {
        self.start <= position && position <= self.end
    }

    #[must_use]
    pub fn is_single_line(&self) -> bool {
        self.start.line == self.end.line
    }

    /// Zero-width range (`start == end`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A range inside a specific file, identified by its `file://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub uri: String,
    pub range: Range,
}

impl Location {
    #[must_use]
    pub fn new(uri: impl Into<String>, range: Range) -> Self {
        Self {
            uri: uri.into(),
            range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: (u32, u32), end: (u32, u32)) -> Range {
        Range::new(
            Position::new(start.0, start.1),
            Position::new(end.0, end.1),
        )
    }

    #[test]
    fn test_position_equality() {
        assert_eq!(Position::new(3, 7), Position::new(3, 7));
        assert_ne!(Position::new(3, 7), Position::new(3, 8));
        assert_ne!(Position::new(3, 7), Position::new(4, 7));
    }

    #[test]
    fn test_position_ordering_is_lexicographic() {
        assert!(Position::new(1, 50) < Position::new(2, 0));
        assert!(Position::new(2, 0) < Position::new(2, 1));
        assert!(Position::new(2, 1) > Position::new(1, 99));
    }

    #[test]
    fn test_range_contains() {
        let r = range((5, 0), (5, 20));
        assert!(r.contains(Position::new(5, 10)));
        assert!(!r.contains(Position::new(6, 0)));
        assert!(!r.contains(Position::new(4, 10)));
    }

    #[test]
    fn test_range_contains_is_inclusive_at_both_ends() {
        let r = range((5, 0), (5, 20));
        assert!(r.contains(Position::new(5, 0)));
        assert!(r.contains(Position::new(5, 20)));
        assert!(!r.contains(Position::new(5, 21)));
    }

    #[test]
    fn test_range_contains_across_lines() {
        let r = range((2, 10), (4, 3));
        assert!(r.contains(Position::new(3, 0)));
        assert!(r.contains(Position::new(3, 500)));
        assert!(!r.contains(Position::new(2, 9)));
        assert!(!r.contains(Position::new(4, 4)));
    }

    #[test]
    fn test_is_single_line() {
        assert!(range((5, 0), (5, 20)).is_single_line());
        assert!(range((5, 3), (5, 3)).is_single_line());
        assert!(!range((5, 0), (6, 0)).is_single_line());
    }

    #[test]
    fn test_wire_shape() {
        let loc = Location::new("file:///a.py", range((1, 2), (1, 4)));
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["uri"], "file:///a.py");
        assert_eq!(json["range"]["start"]["line"], 1);
        assert_eq!(json["range"]["end"]["character"], 4);

        let back: Location = serde_json::from_value(json).unwrap();
        assert_eq!(back, loc);
    }
}
