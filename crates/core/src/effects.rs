use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field_value::Fields;
use crate::ids::{BallotId, CommentId, RowId};
use crate::row::Row;

/// Closed set of network effects. Commit handling is chosen by an exhaustive
/// match on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    FetchRows,
    UpdateComments,
    DeleteComments,
    CreateResolutions,
    UpdateResolutions,
    DeleteResolutions,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchRows => "fetch_rows",
            Self::UpdateComments => "update_comments",
            Self::DeleteComments => "delete_comments",
            Self::CreateResolutions => "create_resolutions",
            Self::UpdateResolutions => "update_resolutions",
            Self::DeleteResolutions => "delete_resolutions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update<Id> {
    pub id: Id,
    pub changes: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    FetchRows {
        scope_id: BallotId,
    },
    UpdateComments {
        updates: Vec<Update<CommentId>>,
        scope_id: BallotId,
        #[serde(rename = "modifiedSince")]
        modified_since: Option<i64>,
    },
    DeleteComments {
        ids: Vec<CommentId>,
        scope_id: BallotId,
        #[serde(rename = "modifiedSince")]
        modified_since: Option<i64>,
    },
    CreateResolutions {
        rows: Vec<Row>,
        scope_id: BallotId,
        #[serde(rename = "modifiedSince")]
        modified_since: Option<i64>,
    },
    UpdateResolutions {
        updates: Vec<Update<RowId>>,
        scope_id: BallotId,
        #[serde(rename = "modifiedSince")]
        modified_since: Option<i64>,
    },
    DeleteResolutions {
        ids: Vec<RowId>,
        scope_id: BallotId,
        #[serde(rename = "modifiedSince")]
        modified_since: Option<i64>,
    },
}

impl Request {
    pub fn kind(&self) -> EffectKind {
        match self {
            Self::FetchRows { .. } => EffectKind::FetchRows,
            Self::UpdateComments { .. } => EffectKind::UpdateComments,
            Self::DeleteComments { .. } => EffectKind::DeleteComments,
            Self::CreateResolutions { .. } => EffectKind::CreateResolutions,
            Self::UpdateResolutions { .. } => EffectKind::UpdateResolutions,
            Self::DeleteResolutions { .. } => EffectKind::DeleteResolutions,
        }
    }

    pub fn scope_id(&self) -> BallotId {
        match self {
            Self::FetchRows { scope_id }
            | Self::UpdateComments { scope_id, .. }
            | Self::DeleteComments { scope_id, .. }
            | Self::CreateResolutions { scope_id, .. }
            | Self::UpdateResolutions { scope_id, .. }
            | Self::DeleteResolutions { scope_id, .. } => *scope_id,
        }
    }

    /// Staleness token carried by write envelopes. `None` for fetches and for
    /// writes against a slice with no modification times yet.
    pub fn modified_since(&self) -> Option<i64> {
        match self {
            Self::FetchRows { .. } => None,
            Self::UpdateComments { modified_since, .. }
            | Self::DeleteComments { modified_since, .. }
            | Self::CreateResolutions { modified_since, .. }
            | Self::UpdateResolutions { modified_since, .. }
            | Self::DeleteResolutions { modified_since, .. } => *modified_since,
        }
    }

    /// Stamp the staleness token. No-op for fetches.
    pub fn set_modified_since(&mut self, token: Option<i64>) {
        match self {
            Self::FetchRows { .. } => {}
            Self::UpdateComments { modified_since, .. }
            | Self::DeleteComments { modified_since, .. }
            | Self::CreateResolutions { modified_since, .. }
            | Self::UpdateResolutions { modified_since, .. }
            | Self::DeleteResolutions { modified_since, .. } => *modified_since = token,
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Authoritative rows returned by the server, merged into the local table by
/// primary key. `deleted` lists rows the server removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub kind: EffectKind,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub deleted: Vec<RowId>,
}

impl Response {
    pub fn new(kind: EffectKind, rows: Vec<Row>) -> Self {
        Self {
            kind,
            rows,
            deleted: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_value::FieldValue;

    #[test]
    fn update_envelope_wire_shape() {
        let scope_id = BallotId::new();
        let comment_id = CommentId::new();
        let mut changes = Fields::new();
        changes.insert("Page".into(), FieldValue::text("12"));
        let request = Request::UpdateComments {
            updates: vec![Update { id: comment_id, changes }],
            scope_id,
            modified_since: Some(1_700_000_000_000),
        };

        let json: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "update_comments");
        assert_eq!(json["modifiedSince"], 1_700_000_000_000_i64);
        assert_eq!(json["scope_id"], scope_id.to_string());
        assert_eq!(json["updates"][0]["id"], comment_id.to_string());
        assert_eq!(json["updates"][0]["changes"]["Page"], "12");

        assert_eq!(Request::from_json(&request.to_json().unwrap()).unwrap(), request);
        assert_eq!(request.kind(), EffectKind::UpdateComments);
    }

    #[test]
    fn response_defaults_missing_lists() {
        let response = Response::from_json(r#"{"kind":"delete_resolutions"}"#).unwrap();
        assert_eq!(response.kind, EffectKind::DeleteResolutions);
        assert!(response.rows.is_empty());
        assert!(response.deleted.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Response::from_json(r#"{"kind":"comments/UPDATE_COMMIT"}"#).is_err());
    }
}
