use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_command_id, Body, CommandId, EntityReference, Method};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Create,
    Update,
    Delete,
}

/// One remote operation the log knows how to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    /// `POST /{collection}`. `entity` is the reference the created entity
    /// stands for: `None` until a brand-new creation first runs, afterwards
    /// the reference it was most recently given.
    Create {
        collection: String,
        body: Body,
        entity: Option<EntityReference>,
    },
    /// `PATCH /{collection}/{id}` with a partial body.
    Update { target: EntityReference, patch: Body },
    /// `DELETE /{collection}/{id}`.
    Delete { target: EntityReference },
}

impl Operation {
    pub fn method(&self) -> Method {
        match self {
            Operation::Create { .. } => Method::Post,
            Operation::Update { .. } => Method::Patch,
            Operation::Delete { .. } => Method::Delete,
        }
    }

    /// Every entity reference carried by the operation.
    pub fn references(&self) -> impl Iterator<Item = &EntityReference> {
        let reference = match self {
            Operation::Create { entity, .. } => entity.as_ref(),
            Operation::Update { target, .. } | Operation::Delete { target } => Some(target),
        };
        reference.into_iter()
    }

    /// Points every reference to `old` at `new`, returning how many changed.
    pub fn rewrite(&mut self, old: &EntityReference, new: &EntityReference) -> usize {
        let reference = match self {
            Operation::Create { entity, .. } => entity.as_mut(),
            Operation::Update { target, .. } | Operation::Delete { target } => Some(target),
        };
        match reference {
            Some(reference) if reference == old => {
                *reference = new.clone();
                1
            }
            _ => 0,
        }
    }
}

/// A reversible, user-initiated mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command<E> {
    pub id: CommandId,
    pub kind: CommandKind,
    pub forward: Operation,
    pub backward: Operation,
    /// Application event re-dispatched whenever the command is applied,
    /// undone or redone.
    pub echo: E,
    pub recorded_at: DateTime<Utc>,
}

impl<E> Command<E> {
    pub fn new(kind: CommandKind, forward: Operation, backward: Operation, echo: E) -> Self {
        Self {
            id: generate_command_id(),
            kind,
            forward,
            backward,
            echo,
            recorded_at: Utc::now(),
        }
    }

    /// Rewrites `old` to `new` in both directions of the command.
    pub fn rewrite(&mut self, old: &EntityReference, new: &EntityReference) -> usize {
        self.forward.rewrite(old, new) + self.backward.rewrite(old, new)
    }

    pub fn references(&self) -> impl Iterator<Item = &EntityReference> {
        self.forward.references().chain(self.backward.references())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Do,
    Undo,
    Redo,
}

/// Notification published once a command has been committed remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedEvent<E> {
    pub echo: E,
    pub direction: Direction,
}

/// Cursor position within a history of `len` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryPosition {
    pub cursor: usize,
    pub len: usize,
}

impl HistoryPosition {
    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.len
    }
}
