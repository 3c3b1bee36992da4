//! Resolution lifecycle: creating, deleting and renumbering the dependent rows
//! of a comment so that every comment keeps at least one row and every row
//! carries the true sibling count.
//!
//! Each operation only plans: it reads the table, checks its inputs and returns
//! one [`Mutation`] per ballot. Nothing is written until the engine submits them.

use std::collections::{BTreeMap, BTreeSet};

use ballotdesk_core::{
    effects::{Request, Update},
    field_value::{FieldValue, Fields},
    ids::*,
    row::{self, Row, keys},
};
use ballotdesk_storage::{Table, TableWrite};
use tracing::warn;

use crate::error::EngineError;

/// One network request together with the local writes it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub request: Request,
    pub writes: Vec<TableWrite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionRequest {
    pub comment_id: CommentId,
    pub fields: Fields,
}

impl ResolutionRequest {
    pub fn new(comment_id: CommentId) -> Self {
        Self {
            comment_id,
            fields: Fields::new(),
        }
    }

    pub fn with_fields(comment_id: CommentId, fields: Fields) -> Self {
        Self { comment_id, fields }
    }
}

#[derive(Debug, Default)]
pub struct CreatePlan {
    pub mutations: Vec<Mutation>,
    /// New rows in request order.
    pub created: Vec<RowId>,
    /// Placeholder rows removed by the create, with the row that replaced them.
    pub absorbed: Vec<(RowId, RowId)>,
}

#[derive(Debug, Default)]
pub struct DeletePlan {
    pub mutations: Vec<Mutation>,
    /// Rows to select once the delete is applied.
    pub selection: Vec<RowId>,
}

pub fn ensure_writable(fields: &Fields) -> Result<(), EngineError> {
    match fields.keys().find(|key| row::is_read_only(key)) {
        Some(key) => Err(EngineError::ReadOnlyField(key.clone())),
        None => Ok(()),
    }
}

fn count_patch(row_id: RowId, count: usize) -> TableWrite {
    TableWrite::set_fields(
        row_id,
        [(keys::RESOLUTION_COUNT.to_string(), FieldValue::Integer(count as i64))],
    )
}

/// Smallest non-negative id not taken by a real sibling.
fn next_resolution_id(siblings: &[Row]) -> u32 {
    let taken: BTreeSet<u32> = siblings.iter().filter_map(Row::resolution_id).collect();
    (0..).find(|n| !taken.contains(n)).unwrap_or(0)
}

pub fn plan_create<T: Table>(
    table: &T,
    requests: &[ResolutionRequest],
) -> Result<CreatePlan, EngineError> {
    for request in requests {
        ensure_writable(&request.fields)?;
    }

    let mut siblings: BTreeMap<CommentId, Vec<Row>> = BTreeMap::new();
    let mut writes: BTreeMap<BallotId, Vec<TableWrite>> = BTreeMap::new();
    let mut created_by_ballot: BTreeMap<BallotId, Vec<(CommentId, RowId)>> = BTreeMap::new();
    let mut plan = CreatePlan::default();

    for request in requests {
        if !siblings.contains_key(&request.comment_id) {
            let rows = table.rows_for_comment(request.comment_id)?;
            siblings.insert(request.comment_id, rows);
        }
        let Some(rows) = siblings.get_mut(&request.comment_id) else {
            continue;
        };
        let Some(first) = rows.first() else {
            warn!(comment_id = %request.comment_id, "no rows for comment; skipping create");
            continue;
        };

        let resolution_id = next_resolution_id(rows);
        let ballot_id = first.ballot_id;
        // Comment data from the first row; the template overwrites every resolution field.
        let mut fields = first.fields.clone();
        fields.extend(row::default_resolution());
        fields.extend(request.fields.clone());
        fields.insert(keys::RESOLUTION_ID.into(), FieldValue::Integer(resolution_id.into()));
        fields.insert(keys::LAST_MODIFIED.into(), FieldValue::Null);

        let (placeholders, mut real): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(Row::is_placeholder);
        let count = real.len() + 1;
        fields.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(count as i64));
        let new_row = Row::new(RowId::new(), ballot_id, request.comment_id, fields);

        let batch = writes.entry(ballot_id).or_default();
        for placeholder in &placeholders {
            batch.push(TableWrite::Remove(placeholder.id));
            plan.absorbed.push((placeholder.id, new_row.id));
        }
        for sibling in &mut real {
            batch.push(count_patch(sibling.id, count));
            sibling.set(keys::RESOLUTION_COUNT, FieldValue::Integer(count as i64));
        }
        batch.push(TableWrite::Put(new_row.clone()));

        created_by_ballot
            .entry(ballot_id)
            .or_default()
            .push((request.comment_id, new_row.id));
        plan.created.push(new_row.id);
        real.push(new_row);
        *rows = real;
    }

    // Rows created earlier in the batch may have had their count bumped since.
    for (ballot_id, created) in created_by_ballot {
        let rows = created
            .iter()
            .filter_map(|(comment_id, row_id)| {
                siblings
                    .get(comment_id)
                    .and_then(|rows| rows.iter().find(|r| r.id == *row_id))
                    .cloned()
            })
            .collect();
        plan.mutations.push(Mutation {
            request: Request::CreateResolutions {
                rows,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes: writes.remove(&ballot_id).unwrap_or_default(),
        });
    }
    Ok(plan)
}

pub fn plan_delete<T: Table>(table: &T, ids: &[RowId]) -> Result<DeletePlan, EngineError> {
    let mut targets: Vec<Row> = Vec::new();
    for id in ids {
        if targets.iter().any(|r| r.id == *id) {
            continue;
        }
        targets.push(table.get(*id)?.ok_or(EngineError::RowNotFound(*id))?);
    }

    let mut groups: Vec<(CommentId, Vec<RowId>)> = Vec::new();
    for target in &targets {
        match groups.iter_mut().find(|(c, _)| *c == target.comment_id) {
            Some((_, ids)) => ids.push(target.id),
            None => groups.push((target.comment_id, vec![target.id])),
        }
    }

    let mut removes: BTreeMap<BallotId, (Vec<RowId>, Vec<TableWrite>)> = BTreeMap::new();
    let mut resets: BTreeMap<BallotId, (Vec<Update<RowId>>, Vec<TableWrite>)> = BTreeMap::new();
    let mut plan = DeletePlan::default();

    for (comment_id, group) in groups {
        let siblings = table.rows_for_comment(comment_id)?;
        let Some(first) = siblings.first() else {
            continue;
        };
        let ballot_id = first.ballot_id;
        let remaining: Vec<&Row> = siblings.iter().filter(|r| !group.contains(&r.id)).collect();

        if remaining.is_empty() {
            // Every row of the comment is targeted: keep one, blanked.
            let keep = first;
            let removed: Vec<RowId> = siblings.iter().skip(1).map(|r| r.id).collect();
            if !removed.is_empty() {
                let (ids, writes) = removes.entry(ballot_id).or_default();
                writes.extend(removed.iter().copied().map(TableWrite::Remove));
                writes.push(count_patch(keep.id, 1));
                ids.extend(removed);
            }
            let template = row::default_resolution();
            let (updates, writes) = resets.entry(ballot_id).or_default();
            writes.push(TableWrite::set_fields(keep.id, template.clone()));
            updates.push(Update {
                id: keep.id,
                changes: template,
            });
            plan.selection.push(keep.id);
        } else {
            let (ids, writes) = removes.entry(ballot_id).or_default();
            writes.extend(group.iter().copied().map(TableWrite::Remove));
            for row in &remaining {
                writes.push(count_patch(row.id, remaining.len()));
            }
            ids.extend(group.iter().copied());
            plan.selection.push(remaining[0].id);
        }
    }

    for (ballot_id, (ids, writes)) in removes {
        plan.mutations.push(Mutation {
            request: Request::DeleteResolutions {
                ids,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes,
        });
    }
    for (ballot_id, (updates, writes)) in resets {
        plan.mutations.push(Mutation {
            request: Request::UpdateResolutions {
                updates,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes,
        });
    }
    Ok(plan)
}

pub fn plan_update_resolutions<T: Table>(
    table: &T,
    updates: &[Update<RowId>],
) -> Result<Vec<Mutation>, EngineError> {
    let mut batches: BTreeMap<BallotId, (Vec<Update<RowId>>, Vec<TableWrite>)> = BTreeMap::new();
    for update in updates {
        ensure_writable(&update.changes)?;
        let row = table.get(update.id)?.ok_or(EngineError::RowNotFound(update.id))?;
        if update.changes.is_empty() {
            continue;
        }
        let (requests, writes) = batches.entry(row.ballot_id).or_default();
        writes.push(TableWrite::set_fields(update.id, update.changes.clone()));
        requests.push(update.clone());
    }

    Ok(batches
        .into_iter()
        .map(|(ballot_id, (updates, writes))| Mutation {
            request: Request::UpdateResolutions {
                updates,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes,
        })
        .collect())
}

/// Comment fields live on every row of the comment, so each update patches
/// all of them.
pub fn plan_update_comments<T: Table>(
    table: &T,
    updates: &[Update<CommentId>],
) -> Result<Vec<Mutation>, EngineError> {
    let mut batches: BTreeMap<BallotId, (Vec<Update<CommentId>>, Vec<TableWrite>)> =
        BTreeMap::new();
    for update in updates {
        ensure_writable(&update.changes)?;
        let rows = table.rows_for_comment(update.id)?;
        let Some(first) = rows.first() else {
            return Err(EngineError::CommentNotFound(update.id));
        };
        if update.changes.is_empty() {
            continue;
        }
        let (requests, writes) = batches.entry(first.ballot_id).or_default();
        writes.extend(
            rows.iter()
                .map(|r| TableWrite::set_fields(r.id, update.changes.clone())),
        );
        requests.push(update.clone());
    }

    Ok(batches
        .into_iter()
        .map(|(ballot_id, (updates, writes))| Mutation {
            request: Request::UpdateComments {
                updates,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes,
        })
        .collect())
}

/// Remove whole comments. Returns the mutations and every row id removed.
pub fn plan_delete_comments<T: Table>(
    table: &T,
    comment_ids: &[CommentId],
) -> Result<(Vec<Mutation>, Vec<RowId>), EngineError> {
    let mut batches: BTreeMap<BallotId, (Vec<CommentId>, Vec<TableWrite>)> = BTreeMap::new();
    let mut removed = Vec::new();
    for comment_id in comment_ids {
        let rows = table.rows_for_comment(*comment_id)?;
        let Some(first) = rows.first() else {
            return Err(EngineError::CommentNotFound(*comment_id));
        };
        let (ids, writes) = batches.entry(first.ballot_id).or_default();
        if ids.contains(comment_id) {
            continue;
        }
        ids.push(*comment_id);
        writes.extend(rows.iter().map(|r| TableWrite::Remove(r.id)));
        removed.extend(rows.iter().map(|r| r.id));
    }

    let mutations = batches
        .into_iter()
        .map(|(ballot_id, (ids, writes))| Mutation {
            request: Request::DeleteComments {
                ids,
                scope_id: ballot_id,
                modified_since: None,
            },
            writes,
        })
        .collect();
    Ok((mutations, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballotdesk_storage::SqliteTable;

    fn row(ballot_id: BallotId, comment_id: CommentId, seq: i64, rid: Option<i64>, count: i64) -> Row {
        let mut fields = Fields::new();
        fields.insert(keys::COMMENT_SEQ.into(), FieldValue::Integer(seq));
        fields.insert(
            keys::RESOLUTION_ID.into(),
            rid.map(FieldValue::Integer).unwrap_or(FieldValue::Null),
        );
        fields.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(count));
        fields.insert(keys::PAGE.into(), FieldValue::text("7"));
        Row::new(RowId::new(), ballot_id, comment_id, fields)
    }

    fn seeded(rows: &[Row]) -> Result<SqliteTable, EngineError> {
        let mut table = SqliteTable::open_in_memory()?;
        let writes: Vec<TableWrite> = rows.iter().cloned().map(TableWrite::Put).collect();
        table.apply(&writes)?;
        Ok(table)
    }

    #[test]
    fn create_takes_smallest_free_id() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let table = seeded(&[
            row(ballot_id, comment_id, 5, Some(0), 2),
            row(ballot_id, comment_id, 5, Some(2), 2),
        ])?;

        let plan = plan_create(&table, &[ResolutionRequest::new(comment_id)])?;
        assert_eq!(plan.mutations.len(), 1);
        let Request::CreateResolutions { rows, .. } = &plan.mutations[0].request else {
            panic!("expected create request");
        };
        assert_eq!(rows[0].resolution_id(), Some(1));
        assert_eq!(rows[0].resolution_count(), 3);
        assert_eq!(rows[0].get(keys::PAGE), Some(&FieldValue::text("7")));
        assert_eq!(rows[0].get(keys::LAST_MODIFIED), Some(&FieldValue::Null));
        Ok(())
    }

    #[test]
    fn create_resets_template_and_carries_comment_data() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let mut first = row(ballot_id, comment_id, 5, Some(0), 1);
        first.set(keys::ASSIGNEE_NAME, FieldValue::text("Ada"));
        first.set(keys::RESOLUTION, FieldValue::text("Accept"));
        first.set("CommenterName", FieldValue::text("A. Member"));
        let table = seeded(&[first])?;

        let plan = plan_create(&table, &[ResolutionRequest::new(comment_id)])?;
        let Request::CreateResolutions { rows, .. } = &plan.mutations[0].request else {
            panic!("expected create request");
        };
        for (key, value) in row::default_resolution() {
            assert_eq!(rows[0].get(&key), Some(&value), "{key} not reset");
        }
        assert_eq!(rows[0].get("CommenterName"), Some(&FieldValue::text("A. Member")));
        assert_eq!(rows[0].get(keys::PAGE), Some(&FieldValue::text("7")));
        Ok(())
    }

    #[test]
    fn create_in_batch_sees_earlier_rows() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let table = seeded(&[row(ballot_id, comment_id, 5, Some(0), 1)])?;

        let plan = plan_create(
            &table,
            &[ResolutionRequest::new(comment_id), ResolutionRequest::new(comment_id)],
        )?;
        let Request::CreateResolutions { rows, .. } = &plan.mutations[0].request else {
            panic!("expected create request");
        };
        let ids: Vec<_> = rows.iter().map(Row::resolution_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2)]);
        assert!(rows.iter().all(|r| r.resolution_count() == 3));
        Ok(())
    }

    #[test]
    fn create_absorbs_placeholder() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let placeholder = row(ballot_id, comment_id, 8, None, 1);
        let table = seeded(&[placeholder.clone()])?;

        let plan = plan_create(&table, &[ResolutionRequest::new(comment_id)])?;
        assert_eq!(plan.absorbed, vec![(placeholder.id, plan.created[0])]);
        let Request::CreateResolutions { rows, .. } = &plan.mutations[0].request else {
            panic!("expected create request");
        };
        assert_eq!(rows[0].resolution_id(), Some(0));
        assert_eq!(rows[0].resolution_count(), 1);
        assert!(plan.mutations[0].writes.contains(&TableWrite::Remove(placeholder.id)));
        Ok(())
    }

    #[test]
    fn create_for_unknown_comment_is_skipped() -> Result<(), EngineError> {
        let table = SqliteTable::open_in_memory()?;
        let plan = plan_create(&table, &[ResolutionRequest::new(CommentId::new())])?;
        assert!(plan.mutations.is_empty());
        assert!(plan.created.is_empty());
        Ok(())
    }

    #[test]
    fn create_refuses_read_only_fields() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let table = seeded(&[row(ballot_id, comment_id, 5, Some(0), 1)])?;
        let mut fields = Fields::new();
        fields.insert(keys::RESOLUTION_ID.into(), FieldValue::Integer(9));
        let err = plan_create(&table, &[ResolutionRequest::with_fields(comment_id, fields)])
            .unwrap_err();
        assert!(matches!(err, EngineError::ReadOnlyField(k) if k == keys::RESOLUTION_ID));
        Ok(())
    }

    #[test]
    fn delete_with_remaining_renumbers_counts() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let r0 = row(ballot_id, comment_id, 5, Some(0), 3);
        let r1 = row(ballot_id, comment_id, 5, Some(1), 3);
        let r2 = row(ballot_id, comment_id, 5, Some(2), 3);
        let table = seeded(&[r0.clone(), r1.clone(), r2.clone()])?;

        let plan = plan_delete(&table, &[r1.id])?;
        assert_eq!(plan.selection, vec![r0.id]);
        assert_eq!(plan.mutations.len(), 1);
        let m = &plan.mutations[0];
        assert!(matches!(&m.request, Request::DeleteResolutions { ids, .. } if ids == &vec![r1.id]));
        assert!(m.writes.contains(&count_patch(r0.id, 2)));
        assert!(m.writes.contains(&count_patch(r2.id, 2)));
        Ok(())
    }

    #[test]
    fn delete_all_keeps_first_row_blanked() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let r0 = row(ballot_id, comment_id, 5, Some(0), 2);
        let r1 = row(ballot_id, comment_id, 5, Some(1), 2);
        let table = seeded(&[r0.clone(), r1.clone()])?;

        let plan = plan_delete(&table, &[r1.id, r0.id])?;
        assert_eq!(plan.selection, vec![r0.id]);
        assert_eq!(plan.mutations.len(), 2);
        assert!(matches!(
            &plan.mutations[0].request,
            Request::DeleteResolutions { ids, .. } if ids == &vec![r1.id]
        ));
        assert!(plan.mutations[0].writes.contains(&count_patch(r0.id, 1)));
        let Request::UpdateResolutions { updates, .. } = &plan.mutations[1].request else {
            panic!("expected reset update");
        };
        assert_eq!(updates[0].id, r0.id);
        assert_eq!(updates[0].changes, row::default_resolution());
        Ok(())
    }

    #[test]
    fn delete_unknown_row_fails_before_planning() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let r0 = row(ballot_id, CommentId::new(), 5, Some(0), 1);
        let table = seeded(&[r0.clone()])?;
        let missing = RowId::new();
        let err = plan_delete(&table, &[r0.id, missing]).unwrap_err();
        assert!(matches!(err, EngineError::RowNotFound(id) if id == missing));
        Ok(())
    }

    #[test]
    fn update_comments_patches_every_row() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let r0 = row(ballot_id, comment_id, 5, Some(0), 2);
        let r1 = row(ballot_id, comment_id, 5, Some(1), 2);
        let table = seeded(&[r0.clone(), r1.clone()])?;

        let mut changes = Fields::new();
        changes.insert(keys::PAGE.into(), FieldValue::text("12"));
        let mutations = plan_update_comments(&table, &[Update { id: comment_id, changes }])?;
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].writes.len(), 2);
        Ok(())
    }

    #[test]
    fn update_refuses_derived_keys() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let r0 = row(ballot_id, CommentId::new(), 5, Some(0), 1);
        let table = seeded(&[r0.clone()])?;
        let mut changes = Fields::new();
        changes.insert(keys::STATUS.into(), FieldValue::text("ready"));
        let err = plan_update_resolutions(&table, &[Update { id: r0.id, changes }]).unwrap_err();
        assert!(matches!(err, EngineError::ReadOnlyField(_)));
        Ok(())
    }

    #[test]
    fn delete_comments_removes_all_rows() -> Result<(), EngineError> {
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let r0 = row(ballot_id, comment_id, 5, Some(0), 2);
        let r1 = row(ballot_id, comment_id, 5, Some(1), 2);
        let table = seeded(&[r0.clone(), r1.clone()])?;

        let (mutations, removed) = plan_delete_comments(&table, &[comment_id])?;
        assert_eq!(removed.len(), 2);
        assert!(matches!(
            &mutations[0].request,
            Request::DeleteComments { ids, .. } if ids == &vec![comment_id]
        ));
        assert!(matches!(
            plan_delete_comments(&table, &[CommentId::new()]),
            Err(EngineError::CommentNotFound(_))
        ));
        Ok(())
    }
}
