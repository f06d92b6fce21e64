// SPDX-FileCopyrightText: 2024 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2024 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// All positions and lengths count Unicode scalar values, never bytes.
#[must_use]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Relay-assigned identifier of one connected client. The total order on ids
/// is the tie-breaker between concurrent operations at the same position.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ParticipantId(pub u32);

/// A primitive change to the shared page, expressed against the state all
/// earlier operations of the same event have produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert `content` immediately before index `pos`.
    Insert { pos: usize, content: String },
    /// Remove the characters in `start..end`. An empty range is legal and
    /// only signals cursor motion.
    Delete { start: usize, end: usize },
    /// Move the author's cursor without touching content.
    MoveCursor { pos: usize },
}

impl Operation {
    /// Where the author's cursor ends up once this operation has been applied.
    #[must_use]
    pub fn cursor_position_after(&self) -> usize {
        match self {
            Self::Insert { pos, content } => pos + char_len(content),
            Self::Delete { start, .. } => *start,
            Self::MoveCursor { pos } => *pos,
        }
    }

    /// Whether applying this operation changes the page text at all.
    /// Everything else is a best-effort cursor hint.
    #[must_use]
    pub fn changes_content(&self) -> bool {
        match self {
            Self::Insert { content, .. } => !content.is_empty(),
            Self::Delete { start, end } => start != end,
            Self::MoveCursor { .. } => false,
        }
    }
}

/// A batch of operations authored by one participant. Operations apply in
/// order, each against the state its predecessors produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub author: ParticipantId,
    pub operations: Vec<Operation>,
}

/// What the relay broadcasts: a content change, or a roster change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Edit(Edit),
    Join { id: ParticipantId },
    Leave { id: ParticipantId },
}

/// Roster entry as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub cursor_pos: usize,
}

/// The wire shape of a whole page: its text plus the current roster.
/// Used to seed the content model and to reload it when the host decides
/// to resynchronize.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub content: String,
    pub participants: Vec<Participant>,
}

pub mod factories {
    use super::*;

    pub fn insert(pos: usize, content: &str) -> Operation {
        Operation::Insert {
            pos,
            content: content.to_string(),
        }
    }

    pub fn delete(start: usize, end: usize) -> Operation {
        Operation::Delete { start, end }
    }

    pub fn move_cursor(pos: usize) -> Operation {
        Operation::MoveCursor { pos }
    }

    pub fn edit(author: u32, operations: Vec<Operation>) -> Edit {
        Edit {
            author: ParticipantId(author),
            operations,
        }
    }

    pub fn edit_event(author: u32, operations: Vec<Operation>) -> Event {
        Event::Edit(edit(author, operations))
    }

    pub fn participant(id: u32, cursor_pos: usize) -> Participant {
        Participant {
            id: ParticipantId(id),
            cursor_pos,
        }
    }

    pub fn snapshot(content: &str, participants: Vec<Participant>) -> Snapshot {
        Snapshot {
            content: content.to_string(),
            participants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::factories::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn char_len_counts_scalars() {
        assert_eq!(char_len(""), 0);
        assert_eq!(char_len("tö🥕s\nt"), 6);
    }

    #[test]
    fn cursor_position_after() {
        assert_eq!(insert(3, "🥕🥕").cursor_position_after(), 5);
        assert_eq!(delete(2, 7).cursor_position_after(), 2);
        assert_eq!(move_cursor(4).cursor_position_after(), 4);
    }

    #[test]
    fn content_changing_operations() {
        assert!(insert(0, "x").changes_content());
        assert!(delete(0, 1).changes_content());
        assert!(!insert(0, "").changes_content());
        assert!(!delete(3, 3).changes_content());
        assert!(!move_cursor(0).changes_content());
    }

    mod serde_shapes {
        use super::*;
        use pretty_assertions::assert_eq;

        fn assert_json<T>(value: &T, json: &str)
        where
            T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
        {
            assert_eq!(serde_json::to_string(value).unwrap(), json);
            assert_eq!(&serde_json::from_str::<T>(json).unwrap(), value);
        }

        #[test]
        fn operations() {
            assert_json(
                &insert(0, "Hello"),
                r#"{"Insert":{"pos":0,"content":"Hello"}}"#,
            );
            assert_json(&delete(0, 2), r#"{"Delete":{"start":0,"end":2}}"#);
            assert_json(&move_cursor(7), r#"{"MoveCursor":{"pos":7}}"#);
        }

        #[test]
        fn events() {
            assert_json(
                &edit_event(1, vec![insert(0, "a")]),
                r#"{"Edit":{"author":1,"operations":[{"Insert":{"pos":0,"content":"a"}}]}}"#,
            );
            assert_json(
                &Event::Join {
                    id: ParticipantId(2),
                },
                r#"{"Join":{"id":2}}"#,
            );
            assert_json(
                &Event::Leave {
                    id: ParticipantId(2),
                },
                r#"{"Leave":{"id":2}}"#,
            );
        }

        #[test]
        fn snapshots() {
            assert_json(
                &snapshot("Hello", vec![participant(1, 5)]),
                r#"{"content":"Hello","participants":[{"id":1,"cursor_pos":5}]}"#,
            );
        }

        #[test]
        fn unknown_operation_tag_fails() {
            assert!(serde_json::from_str::<Operation>(r#"{"Replace":{"pos":0}}"#).is_err());
            assert!(serde_json::from_str::<Event>(r#"{"Rename":{"id":1}}"#).is_err());
        }
    }
}
