use std::collections::BTreeSet;

use ballotdesk_core::{
    effects::Update,
    ids::*,
    row::{Row, keys},
};

use crate::merge::{Changes, resolve_changes};
use crate::resolutions::ResolutionRequest;

/// Fields stored on the comment and shown on each of its rows.
pub const COMMENT_OWNED: &[&str] = &[
    keys::ADHOC_GROUP,
    keys::COMMENT_GROUP,
    keys::NOTES,
    keys::PAGE,
    keys::CLAUSE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Comment,
    Resolution,
}

pub fn owner(key: &str) -> Owner {
    if COMMENT_OWNED.contains(&key) {
        Owner::Comment
    } else {
        Owner::Resolution
    }
}

/// Split a change-set by owning entity: `(comment, resolution)`.
pub fn split(changes: &Changes) -> (Changes, Changes) {
    changes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(key, _)| owner(key) == Owner::Comment)
}

/// Concrete writes for one flush, grouped by the operation that carries them.
#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    pub comments: Vec<Update<CommentId>>,
    pub resolutions: Vec<Update<RowId>>,
    /// Placeholder rows touched on resolution-owned fields, with the placeholder
    /// each request replaces.
    pub materialize: Vec<(RowId, ResolutionRequest)>,
}

impl Routed {
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty() && self.resolutions.is_empty() && self.materialize.is_empty()
    }
}

/// Resolve `changes` against each selected row and route them to their owner.
pub fn route(changes: &Changes, rows: &[Row]) -> Routed {
    let (comment_changes, resolution_changes) = split(changes);
    let mut routed = Routed::default();

    if !comment_changes.is_empty() {
        let mut seen = BTreeSet::new();
        for row in rows {
            if !seen.insert(row.comment_id) {
                continue;
            }
            let resolved = resolve_changes(&comment_changes, &row.fields);
            if !resolved.is_empty() {
                routed.comments.push(Update {
                    id: row.comment_id,
                    changes: resolved,
                });
            }
        }
    }

    if !resolution_changes.is_empty() {
        for row in rows {
            let resolved = resolve_changes(&resolution_changes, &row.fields);
            if resolved.is_empty() {
                continue;
            }
            if row.is_placeholder() {
                routed
                    .materialize
                    .push((row.id, ResolutionRequest::with_fields(row.comment_id, resolved)));
            } else {
                routed.resolutions.push(Update {
                    id: row.id,
                    changes: resolved,
                });
            }
        }
    }

    routed
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballotdesk_core::field_value::{FieldValue, Fields};

    use crate::merge::Merged;

    fn row(comment_id: CommentId, rid: Option<i64>) -> Row {
        let mut fields = Fields::new();
        fields.insert(keys::COMMENT_SEQ.into(), FieldValue::Integer(1));
        fields.insert(
            keys::RESOLUTION_ID.into(),
            rid.map(FieldValue::Integer).unwrap_or(FieldValue::Null),
        );
        fields.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(1));
        fields.insert(keys::PAGE.into(), FieldValue::text("4"));
        Row::new(RowId::new(), BallotId::new(), comment_id, fields)
    }

    fn changes(pairs: &[(&str, Merged)]) -> Changes {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn ownership_is_static() {
        assert_eq!(owner(keys::PAGE), Owner::Comment);
        assert_eq!(owner(keys::ADHOC_GROUP), Owner::Comment);
        assert_eq!(owner(keys::ASSIGNEE_NAME), Owner::Resolution);
        assert_eq!(owner("SomethingElse"), Owner::Resolution);
    }

    #[test]
    fn comment_changes_go_once_per_comment() {
        let shared = CommentId::new();
        let rows = vec![row(shared, Some(0)), row(shared, Some(1)), row(CommentId::new(), Some(0))];
        let routed = route(
            &changes(&[(keys::PAGE, Merged::Concrete(FieldValue::text("12")))]),
            &rows,
        );
        assert_eq!(routed.comments.len(), 2);
        assert!(routed.resolutions.is_empty());
        assert!(routed.comments.iter().all(|u| u.changes.get(keys::PAGE) == Some(&FieldValue::text("12"))));
    }

    #[test]
    fn placeholder_rows_are_materialized() {
        let placeholder = row(CommentId::new(), None);
        let real = row(CommentId::new(), Some(0));
        let routed = route(
            &changes(&[(keys::ASSIGNEE_NAME, Merged::Concrete(FieldValue::text("Ada")))]),
            &[placeholder.clone(), real.clone()],
        );
        assert_eq!(routed.resolutions.len(), 1);
        assert_eq!(routed.resolutions[0].id, real.id);
        assert_eq!(routed.materialize.len(), 1);
        assert_eq!(routed.materialize[0].0, placeholder.id);
        assert_eq!(routed.materialize[0].1.comment_id, placeholder.comment_id);
    }

    #[test]
    fn mixed_changes_are_split() {
        let r = row(CommentId::new(), Some(0));
        let routed = route(
            &changes(&[
                (keys::NOTES, Merged::Concrete(FieldValue::text("n"))),
                (keys::RESOLUTION, Merged::Concrete(FieldValue::text("Accept"))),
            ]),
            &[r],
        );
        assert_eq!(routed.comments.len(), 1);
        assert_eq!(routed.resolutions.len(), 1);
        assert!(!routed.comments[0].changes.contains_key(keys::RESOLUTION));
        assert!(!routed.resolutions[0].changes.contains_key(keys::NOTES));
    }
}
