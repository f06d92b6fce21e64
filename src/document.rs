// SPDX-FileCopyrightText: 2024 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2024 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::types::{char_len, Event, Operation, Participant, ParticipantId, Snapshot};
use dissimilar::Chunk;
use ropey::Rope;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Why an event was rejected. Validation runs over the whole event before
/// anything is touched, so a rejected event leaves the document unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditError {
    /// An operation referenced an index beyond the current content length.
    #[error("operation is outside of the document")]
    OutsideDocument,
    /// The event contradicts itself or the participant roster.
    #[error("operation is invalid")]
    InvalidOperation,
}

/// The local replica of one wiki page: its text plus every participant's
/// cursor. This is the authoritative state the editing widget renders.
///
/// Server events go through [`Document::apply_event`], which validates the
/// whole event first and only then splices. Local typing enters through
/// [`Document::update`], which turns the widget's new text into operations
/// for the session.
#[derive(Debug, Clone, Default)]
pub struct Document {
    seq: u64,
    content: Rope,
    participants: BTreeMap<ParticipantId, usize>,
    local_id: Option<ParticipantId>,
}

impl Document {
    #[must_use]
    pub fn new(seq: u64, snapshot: &Snapshot) -> Self {
        let mut document = Self::default();
        document.load(seq, snapshot);
        document
    }

    /// Replaces content and roster wholesale. Also the resynchronization
    /// path: after a content error the host can fetch a fresh snapshot and
    /// load it here.
    pub fn load(&mut self, seq: u64, snapshot: &Snapshot) {
        self.seq = seq;
        self.content = Rope::from_str(&snapshot.content);
        self.participants = snapshot
            .participants
            .iter()
            .map(|participant| (participant.id, participant.cursor_pos))
            .collect();
    }

    /// Records which participant this replica belongs to. Happens exactly
    /// once, when the relay confirms the connection.
    pub fn set_local_id(&mut self, id: ParticipantId) {
        assert!(
            self.local_id.is_none(),
            "The relay must assign our participant id only once"
        );
        self.local_id = Some(id);
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn content(&self) -> String {
        self.content.to_string()
    }

    #[must_use]
    pub fn len_chars(&self) -> usize {
        self.content.len_chars()
    }

    #[must_use]
    pub fn participant_position(&self, id: ParticipantId) -> Option<usize> {
        self.participants.get(&id).copied()
    }

    /// Moves a participant's cursor bookmark without going through an event.
    pub fn set_participant_position(
        &mut self,
        id: ParticipantId,
        pos: usize,
    ) -> Result<(), EditError> {
        if pos > self.content.len_chars() {
            return Err(EditError::OutsideDocument);
        }
        let cursor = self
            .participants
            .get_mut(&id)
            .ok_or(EditError::InvalidOperation)?;
        *cursor = pos;
        Ok(())
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            content: self.content(),
            participants: self
                .participants
                .iter()
                .map(|(id, cursor_pos)| Participant {
                    id: *id,
                    cursor_pos: *cursor_pos,
                })
                .collect(),
        }
    }

    pub fn add_participant(&mut self, seq: u64, participant: Participant) -> Result<(), EditError> {
        if self.participants.contains_key(&participant.id) {
            return Err(EditError::InvalidOperation);
        }
        if participant.cursor_pos > self.content.len_chars() {
            return Err(EditError::OutsideDocument);
        }
        self.participants.insert(participant.id, participant.cursor_pos);
        self.seq = seq;
        Ok(())
    }

    pub fn remove_participant(&mut self, seq: u64, id: ParticipantId) -> Result<(), EditError> {
        if self.participants.remove(&id).is_none() {
            return Err(EditError::InvalidOperation);
        }
        self.seq = seq;
        Ok(())
    }

    /// Checks whether `event` could be applied right now, without applying
    /// it. Edit operations are simulated against a running length, since
    /// each operation applies to the state its predecessors produced.
    pub fn can_apply(&self, event: &Event) -> Result<(), EditError> {
        match event {
            Event::Join { id } => {
                if self.participants.contains_key(id) {
                    return Err(EditError::InvalidOperation);
                }
            }
            Event::Leave { id } => {
                if !self.participants.contains_key(id) {
                    return Err(EditError::InvalidOperation);
                }
            }
            Event::Edit(edit) => {
                if !self.participants.contains_key(&edit.author) {
                    return Err(EditError::InvalidOperation);
                }
                let mut length = self.content.len_chars();
                for operation in &edit.operations {
                    match operation {
                        Operation::Insert { pos, content } => {
                            if *pos > length {
                                return Err(EditError::OutsideDocument);
                            }
                            length += char_len(content);
                        }
                        Operation::Delete { start, end } => {
                            if start > end {
                                return Err(EditError::InvalidOperation);
                            }
                            if *end > length {
                                return Err(EditError::OutsideDocument);
                            }
                            length -= end - start;
                        }
                        Operation::MoveCursor { pos } => {
                            if *pos > length {
                                return Err(EditError::OutsideDocument);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies a server event and advances the sequence number. Fails
    /// atomically: on any error the content and every cursor are untouched.
    pub fn apply_event(&mut self, seq: u64, event: &Event) -> Result<(), EditError> {
        self.can_apply(event)?;
        match event {
            Event::Join { id } => {
                self.participants.insert(*id, 0);
            }
            Event::Leave { id } => {
                self.participants.remove(id);
            }
            Event::Edit(edit) => {
                debug!(
                    "Applying edit by {} with {} operation(s)",
                    edit.author,
                    edit.operations.len()
                );
                for operation in &edit.operations {
                    self.apply_operation(edit.author, operation);
                }
            }
        }
        self.seq = seq;
        Ok(())
    }

    /// Splices one already-validated operation and maintains the cursor
    /// bookmarks: the author's cursor follows the operation, everyone
    /// else's shifts like a bookmark around the change. The one exception
    /// keeps the caret from jumping under the user's fingers: a remote
    /// insert landing exactly on the local cursor leaves it in place.
    fn apply_operation(&mut self, author: ParticipantId, operation: &Operation) {
        match operation {
            Operation::Insert { pos, content } => {
                self.content.insert(*pos, content);
                let inserted = char_len(content);
                for (id, cursor) in &mut self.participants {
                    if *id == author {
                        *cursor = pos + inserted;
                    } else if *cursor > *pos {
                        *cursor += inserted;
                    } else if *cursor == *pos && Some(*id) != self.local_id {
                        *cursor += inserted;
                    }
                }
            }
            Operation::Delete { start, end } => {
                self.content.remove(*start..*end);
                let removed = end - start;
                for (id, cursor) in &mut self.participants {
                    if *id == author {
                        *cursor = *start;
                    } else if *cursor >= *end {
                        *cursor -= removed;
                    } else if *cursor > *start {
                        // The bookmark sat inside the removed range.
                        *cursor = *start;
                    }
                }
            }
            Operation::MoveCursor { pos } => {
                if let Some(cursor) = self.participants.get_mut(&author) {
                    *cursor = *pos;
                }
            }
        }
    }

    /// Converts the widget's current text and caret into operations, applies
    /// them locally and returns them for the session's outbox. The trailing
    /// MoveCursor is a best-effort hint; the session drops it again when the
    /// preceding operations already put the cursor there.
    pub fn update(&mut self, new_text: &str, cursor: usize) -> Vec<Operation> {
        let local_id = self
            .local_id
            .expect("Must be connected before editing locally");
        let current = self.content();
        let mut operations = Vec::new();
        let mut pos = 0;
        for chunk in dissimilar::diff(&current, new_text) {
            match chunk {
                Chunk::Equal(text) => {
                    pos += char_len(text);
                }
                Chunk::Delete(text) => {
                    let operation = Operation::Delete {
                        start: pos,
                        end: pos + char_len(text),
                    };
                    self.apply_operation(local_id, &operation);
                    operations.push(operation);
                }
                Chunk::Insert(text) => {
                    let operation = Operation::Insert {
                        pos,
                        content: text.to_string(),
                    };
                    self.apply_operation(local_id, &operation);
                    operations.push(operation);
                    pos += char_len(text);
                }
            }
        }
        let moved = Operation::MoveCursor { pos: cursor };
        self.apply_operation(local_id, &moved);
        operations.push(moved);
        operations
    }
}
