use std::collections::BTreeMap;

use ballotdesk_core::{
    field_value::FieldValue,
    ids::*,
    row::Row,
};

use crate::error::StorageError;

/// One primitive change to the local table. Forward mutations and their
/// captured rollbacks are both expressed as ordered lists of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableWrite {
    /// Insert the row, or replace it wholesale if the id exists.
    Put(Row),
    Remove(RowId),
    /// Field-level write. `None` removes the key. A patch on a missing row is a no-op.
    Patch {
        row_id: RowId,
        fields: BTreeMap<String, Option<FieldValue>>,
    },
}

impl TableWrite {
    pub fn row_id(&self) -> RowId {
        match self {
            Self::Put(row) => row.id,
            Self::Remove(row_id) | Self::Patch { row_id, .. } => *row_id,
        }
    }

    /// Field patch that sets every given key.
    pub fn set_fields(
        row_id: RowId,
        fields: impl IntoIterator<Item = (String, FieldValue)>,
    ) -> Self {
        Self::Patch {
            row_id,
            fields: fields.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }

    /// Apply this write to an in-memory copy of one row slot.
    pub fn apply_to(&self, slot: &mut Option<Row>) {
        match self {
            Self::Put(row) => *slot = Some(row.clone()),
            Self::Remove(_) => *slot = None,
            Self::Patch { fields, .. } => {
                if let Some(row) = slot {
                    for (key, value) in fields {
                        match value {
                            Some(v) => {
                                row.fields.insert(key.clone(), v.clone());
                            }
                            None => {
                                row.fields.remove(key);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// The local copy of the comment/resolution rows.
pub trait Table {
    fn get(&self, row_id: RowId) -> Result<Option<Row>, StorageError>;

    /// Rows sharing a comment, ordered by `ResolutionID` (placeholder first).
    fn rows_for_comment(&self, comment_id: CommentId) -> Result<Vec<Row>, StorageError>;

    /// Rows of a ballot, ordered by `CommentID` then `ResolutionID`.
    fn rows_for_ballot(&self, ballot_id: BallotId) -> Result<Vec<Row>, StorageError>;

    fn row_count(&self) -> Result<u64, StorageError>;

    /// Maximum `LastModifiedTime` across the ballot's rows.
    fn max_last_modified(&self, ballot_id: BallotId) -> Result<Option<i64>, StorageError>;

    /// Apply writes in order inside one transaction: all or nothing.
    fn apply(&mut self, writes: &[TableWrite]) -> Result<(), StorageError>;

    /// Replace the ballot's whole slice with `rows`.
    fn replace_ballot(&mut self, ballot_id: BallotId, rows: &[Row]) -> Result<(), StorageError>;

    /// Content hash over every row in primary-key order.
    fn digest(&self) -> Result<[u8; 32], StorageError>;
}
