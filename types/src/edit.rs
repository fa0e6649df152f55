//! Text edits and multi-file workspace edits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::position::Range;

/// Replace `range` with `new_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

impl TextEdit {
    #[must_use]
    pub fn new(range: Range, new_text: impl Into<String>) -> Self {
        Self {
            range,
            new_text: new_text.into(),
        }
    }

    /// Removes text without inserting anything.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.new_text.is_empty()
    }

    /// Zero-width range, whatever the text.
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.range.is_empty()
    }
}

/// Edits spanning one or more files, keyed by URI.
///
/// Edits for one file keep the order the server sent them in. They are not
/// guaranteed to be non-overlapping; applying them is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceEdit {
    changes: BTreeMap<String, Vec<TextEdit>>,
}

impl WorkspaceEdit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `edits` to the edits already recorded for `uri`.
    pub fn push_edits(&mut self, uri: impl Into<String>, edits: impl IntoIterator<Item = TextEdit>) {
        self.changes.entry(uri.into()).or_default().extend(edits);
    }

    /// Number of distinct files touched.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn total_edits(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn edits_for(&self, uri: &str) -> Option<&[TextEdit]> {
        self.changes.get(uri).map(Vec::as_slice)
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TextEdit])> {
        self.changes
            .iter()
            .map(|(uri, edits)| (uri.as_str(), edits.as_slice()))
    }
}

impl FromIterator<(String, Vec<TextEdit>)> for WorkspaceEdit {
    fn from_iter<I: IntoIterator<Item = (String, Vec<TextEdit>)>>(iter: I) -> Self {
        let mut edit = Self::new();
        for (uri, edits) in iter {
            edit.push_edits(uri, edits);
        }
        edit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    fn edit(start: (u32, u32), end: (u32, u32), text: &str) -> TextEdit {
        TextEdit::new(
            Range::new(Position::new(start.0, start.1), Position::new(end.0, end.1)),
            text,
        )
    }

    #[test]
    fn test_is_delete() {
        assert!(edit((1, 0), (1, 4), "").is_delete());
        assert!(!edit((1, 0), (1, 4), "x").is_delete());
    }

    #[test]
    fn test_is_insert_ignores_text() {
        assert!(edit((2, 3), (2, 3), "inserted").is_insert());
        // Zero-width and empty: both an insert and a delete by definition.
        let noop = edit((2, 3), (2, 3), "");
        assert!(noop.is_insert());
        assert!(noop.is_delete());
        assert!(!edit((2, 3), (2, 4), "replaced").is_insert());
    }

    #[test]
    fn test_file_count_empty() {
        let edit = WorkspaceEdit::new();
        assert_eq!(edit.file_count(), 0);
        assert!(edit.is_empty());
        assert_eq!(edit.total_edits(), 0);
    }

    #[test]
    fn test_file_count_counts_distinct_uris() {
        let mut ws = WorkspaceEdit::new();
        ws.push_edits("file:///a.py", [edit((0, 4), (0, 7), "bar")]);
        ws.push_edits("file:///b.py", [edit((3, 0), (3, 3), "bar")]);
        ws.push_edits("file:///a.py", [edit((9, 1), (9, 4), "bar")]);

        assert_eq!(ws.file_count(), 2);
        assert_eq!(ws.total_edits(), 3);
        assert_eq!(ws.edits_for("file:///a.py").map(<[TextEdit]>::len), Some(2));
        assert!(ws.edits_for("file:///c.py").is_none());
        assert_eq!(
            ws.uris().collect::<Vec<_>>(),
            vec!["file:///a.py", "file:///b.py"]
        );
    }

    #[test]
    fn test_edits_keep_server_order() {
        let ws: WorkspaceEdit = [(
            "file:///a.py".to_string(),
            vec![edit((9, 0), (9, 1), "z"), edit((1, 0), (1, 1), "a")],
        )]
        .into_iter()
        .collect();
        let edits = ws.edits_for("file:///a.py").unwrap();
        assert_eq!(edits[0].new_text, "z");
        assert_eq!(edits[1].new_text, "a");
    }

    #[test]
    fn test_text_edit_wire_shape() {
        let json = serde_json::json!({
            "range": { "start": { "line": 0, "character": 4 }, "end": { "line": 0, "character": 7 } },
            "newText": "renamed"
        });
        let parsed: TextEdit = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.new_text, "renamed");
        assert_eq!(parsed.range.start, Position::new(0, 4));
    }
}
