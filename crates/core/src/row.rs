//! The flattened comment/resolution row and its derived values.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::{FieldValue, Fields};
use crate::ids::{BallotId, CommentId, RowId};

/// Field names the engine itself understands.
pub mod keys {
    pub const COMMENT_SEQ: &str = "CommentID";
    pub const RESOLUTION_ID: &str = "ResolutionID";
    pub const RESOLUTION_COUNT: &str = "ResolutionCount";
    pub const LAST_MODIFIED: &str = "LastModifiedTime";

    // Comment-owned, edited alongside resolutions.
    pub const ADHOC_GROUP: &str = "AdHocGroupId";
    pub const COMMENT_GROUP: &str = "CommentGroup";
    pub const NOTES: &str = "Notes";
    pub const PAGE: &str = "Page";
    pub const CLAUSE: &str = "Clause";

    // Resolution-owned.
    pub const ASSIGNEE_SAPIN: &str = "AssigneeSAPIN";
    pub const ASSIGNEE_NAME: &str = "AssigneeName";
    pub const RESN_STATUS: &str = "ResnStatus";
    pub const RESOLUTION: &str = "Resolution";
    pub const SUBMISSION: &str = "Submission";
    pub const READY_FOR_MOTION: &str = "ReadyForMotion";
    pub const APPROVED_BY_MOTION: &str = "ApprovedByMotion";
    pub const EDIT_STATUS: &str = "EditStatus";
    pub const EDIT_IN_DRAFT: &str = "EditInDraft";
    pub const EDIT_NOTES: &str = "EditNotes";

    // Derived on read, never stored.
    pub const DISPLAY_ID: &str = "CID";
    pub const STATUS: &str = "Status";
}

/// Keys that no edit or update may write: derived values and the identity
/// columns the lifecycle manager maintains itself.
pub const READ_ONLY_KEYS: &[&str] = &[
    keys::DISPLAY_ID,
    keys::STATUS,
    keys::COMMENT_SEQ,
    keys::RESOLUTION_ID,
    keys::RESOLUTION_COUNT,
    keys::LAST_MODIFIED,
];

pub fn is_read_only(key: &str) -> bool {
    READ_ONLY_KEYS.contains(&key)
}

/// The complete set of resolution fields, with the values a freshly created
/// (or blanked) resolution gets.
///
/// Creating or blanking a resolution resets exactly these keys. Any other
/// stored key is comment data and is carried over from the comment's first
/// row unchanged.
pub fn default_resolution() -> Fields {
    let mut fields = Fields::new();
    fields.insert(keys::ASSIGNEE_SAPIN.into(), FieldValue::Null);
    fields.insert(keys::ASSIGNEE_NAME.into(), FieldValue::text(""));
    fields.insert(keys::RESN_STATUS.into(), FieldValue::Null);
    fields.insert(keys::RESOLUTION.into(), FieldValue::text(""));
    fields.insert(keys::SUBMISSION.into(), FieldValue::text(""));
    fields.insert(keys::READY_FOR_MOTION.into(), FieldValue::Boolean(false));
    fields.insert(keys::APPROVED_BY_MOTION.into(), FieldValue::text(""));
    fields.insert(keys::EDIT_STATUS.into(), FieldValue::text(""));
    fields.insert(keys::EDIT_IN_DRAFT.into(), FieldValue::text(""));
    fields.insert(keys::EDIT_NOTES.into(), FieldValue::text(""));
    fields
}

/// One comment merged with one of its resolutions.
///
/// A comment without any resolution is represented by a single placeholder row
/// whose `ResolutionID` is null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub ballot_id: BallotId,
    pub comment_id: CommentId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Row {
    pub fn new(id: RowId, ballot_id: BallotId, comment_id: CommentId, fields: Fields) -> Self {
        Self {
            id,
            ballot_id,
            comment_id,
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: &str, value: FieldValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn comment_seq(&self) -> Option<i64> {
        self.get(keys::COMMENT_SEQ).and_then(FieldValue::as_integer)
    }

    /// `None` for a placeholder row.
    pub fn resolution_id(&self) -> Option<u32> {
        self.get(keys::RESOLUTION_ID)
            .and_then(FieldValue::as_integer)
            .and_then(|n| u32::try_from(n).ok())
    }

    pub fn is_placeholder(&self) -> bool {
        self.resolution_id().is_none()
    }

    pub fn resolution_count(&self) -> u32 {
        self.get(keys::RESOLUTION_COUNT)
            .and_then(FieldValue::as_integer)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1)
    }

    pub fn last_modified(&self) -> Option<i64> {
        self.get(keys::LAST_MODIFIED).and_then(FieldValue::as_integer)
    }

    /// Structural shape check applied to every row before it is written locally.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: &str| CoreError::InvalidRow {
            row_id: self.id.to_string(),
            reason: reason.to_string(),
        };

        match self.get(keys::COMMENT_SEQ) {
            Some(FieldValue::Integer(_)) => {}
            _ => return Err(invalid("CommentID must be an integer")),
        }
        match self.get(keys::RESOLUTION_ID) {
            None | Some(FieldValue::Null) => {}
            Some(FieldValue::Integer(n)) if *n >= 0 && *n <= u32::MAX as i64 => {}
            Some(_) => return Err(invalid("ResolutionID must be a non-negative integer or null")),
        }
        match self.get(keys::RESOLUTION_COUNT) {
            Some(FieldValue::Integer(n)) if *n >= 1 => {}
            _ => return Err(invalid("ResolutionCount must be an integer >= 1")),
        }
        if self.fields.keys().any(|k| k == keys::DISPLAY_ID || k == keys::STATUS) {
            return Err(invalid("derived fields must not be stored"));
        }
        Ok(())
    }
}

/// `CommentID` alone for a comment with a single resolution, otherwise
/// `CommentID.ResolutionID`.
pub fn display_id(row: &Row) -> String {
    let seq = row
        .comment_seq()
        .map(|n| n.to_string())
        .unwrap_or_default();
    if row.resolution_count() <= 1 {
        return seq;
    }
    match row.resolution_id() {
        Some(rid) => format!("{seq}.{rid}"),
        None => seq,
    }
}

pub fn status_label(row: &Row) -> &'static str {
    let set = |key: &str| row.get(key).is_some_and(|v| !v.is_blank());

    if set(keys::APPROVED_BY_MOTION) {
        "approved"
    } else if row.get(keys::READY_FOR_MOTION).and_then(FieldValue::as_boolean) == Some(true) {
        "ready"
    } else if set(keys::RESN_STATUS) {
        "drafted"
    } else if set(keys::ASSIGNEE_NAME) || set(keys::ASSIGNEE_SAPIN) {
        "assigned"
    } else {
        ""
    }
}

/// Read a field, resolving the derived keys.
pub fn field(row: &Row, key: &str) -> FieldValue {
    match key {
        keys::DISPLAY_ID => FieldValue::Text(display_id(row)),
        keys::STATUS => FieldValue::text(status_label(row)),
        _ => row.get(key).cloned().unwrap_or(FieldValue::Null),
    }
}

/// Stored fields plus the derived ones, the shape the edit buffer merges.
pub fn display_fields(row: &Row) -> Fields {
    let mut fields = row.fields.clone();
    fields.insert(keys::DISPLAY_ID.into(), field(row, keys::DISPLAY_ID));
    fields.insert(keys::STATUS.into(), field(row, keys::STATUS));
    fields
}
