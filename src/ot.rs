// SPDX-FileCopyrightText: 2024 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2024 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The transform function that makes concurrent edits converge.
//!
//! Whenever two participants change the page at the same time, the relay
//! puts their events into one order, and everyone who already applied their
//! own change has to rewrite the other side's operations before applying
//! them. `transform` produces that rewrite:
//!
//! ```text
//!            a                      a = our operation
//!         * ----> *                 b = their operation, concurrent with a
//!         |       |
//!       b |       | b' = b.transform(a, ...)
//!         v  a'   v
//!         * ----> *
//! ```
//!
//! Both paths through the square end in the same document. When `a` and `b`
//! insert at the very same position, neither "happened first", so the total
//! order on participant ids decides: `has_priority` is true iff the author
//! of the operation being transformed sorts *lower* than the author of the
//! other one, and the lower author's insert ends up to the right.
//!
//! Transforming a Delete across an Insert that lands inside its range splits
//! it into two deletions. The piece after the insertion comes first in the
//! result, so that applying the pieces in order doesn't shift the second
//! piece's indices.

use crate::types::{char_len, Edit, Event, Operation};
use tracing::debug;

impl Operation {
    /// Rewrites `self` so that it can be applied after `other`, where both
    /// were created against the same document state. Usually returns one
    /// operation; a Delete split in two by a concurrent Insert returns two.
    #[must_use]
    pub fn transform(&self, other: &Self, has_priority: bool) -> Vec<Self> {
        match (self, other) {
            (
                Self::Insert { pos, content },
                Self::Insert {
                    pos: other_pos,
                    content: other_content,
                },
            ) => {
                let mut pos = *pos;
                if other_pos < &pos || (*other_pos == pos && has_priority) {
                    pos += char_len(other_content);
                }
                vec![Self::Insert {
                    pos,
                    content: content.clone(),
                }]
            }
            (
                Self::Insert { pos, content },
                Self::Delete {
                    start: other_start,
                    end: other_end,
                },
            ) => {
                let mut pos = *pos;
                if other_start < &pos {
                    pos -= pos.min(*other_end) - other_start;
                }
                vec![Self::Insert {
                    pos,
                    content: content.clone(),
                }]
            }
            (op @ Self::Insert { .. }, Self::MoveCursor { .. }) => vec![op.clone()],
            (
                Self::Delete { start, end },
                Self::Insert {
                    pos: other_pos,
                    content,
                },
            ) => {
                let (mut start, mut end) = (*start, *end);
                let inserted = char_len(content);
                if other_pos < &start {
                    start += inserted;
                    end += inserted;
                } else if *other_pos < end && end > start {
                    // The insertion landed inside our range: split around it.
                    debug!(
                        "Splitting Delete({start}, {end}) around an Insert at {other_pos}"
                    );
                    return vec![
                        Self::Delete {
                            start: other_pos + inserted,
                            end: end + inserted,
                        },
                        Self::Delete {
                            start,
                            end: *other_pos,
                        },
                    ];
                }
                vec![Self::Delete { start, end }]
            }
            (
                Self::Delete { start, end },
                Self::Delete {
                    start: other_start,
                    end: other_end,
                },
            ) => {
                let deleted_before = other_end.min(start).saturating_sub(*other_start);
                let deleted_inside = other_end.min(end).saturating_sub(*other_start.max(start));
                vec![Self::Delete {
                    start: start - deleted_before,
                    end: end - deleted_before - deleted_inside,
                }]
            }
            (op @ Self::Delete { .. }, Self::MoveCursor { .. }) => vec![op.clone()],
            (
                Self::MoveCursor { pos },
                Self::Insert {
                    pos: other_pos,
                    content,
                },
            ) => {
                let mut pos = *pos;
                // On a tie the cursor stays put; a cursor hint never takes
                // priority over a peer's insert.
                if other_pos < &pos {
                    pos += char_len(content);
                }
                vec![Self::MoveCursor { pos }]
            }
            (
                Self::MoveCursor { pos },
                Self::Delete {
                    start: other_start,
                    end: other_end,
                },
            ) => {
                let mut pos = *pos;
                if other_start < &pos {
                    pos -= pos.min(*other_end) - other_start;
                }
                vec![Self::MoveCursor { pos }]
            }
            (op @ Self::MoveCursor { .. }, Self::MoveCursor { .. }) => vec![op.clone()],
        }
    }
}

impl Edit {
    /// Rewrites this edit's operations so they apply after `other`. Roster
    /// events don't move text, so only a concurrent Edit has any effect.
    /// The author order decides ties: we get priority iff our author id is
    /// the lower one.
    pub fn transform(&mut self, other: &Event) {
        let Event::Edit(other_edit) = other else {
            return;
        };
        let has_priority = self.author < other_edit.author;
        for other_op in &other_edit.operations {
            let mut transformed = Vec::with_capacity(self.operations.len());
            for op in &self.operations {
                transformed.extend(op.transform(other_op, has_priority));
            }
            self.operations = transformed;
        }
    }
}

impl Event {
    /// Event-level entry point: Join and Leave pass through untouched.
    pub fn transform(&mut self, other: &Event) {
        if let Event::Edit(edit) = self {
            edit.transform(other);
        }
    }
}
