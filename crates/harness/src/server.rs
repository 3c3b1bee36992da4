use std::collections::{BTreeMap, BTreeSet};

use ballotdesk_core::{
    effects::{EffectKind, Request, Response, Update},
    field_value::{FieldValue, Fields},
    ids::*,
    row::{Row, keys},
};
use ballotdesk_engine::TransportError;
use ballotdesk_storage::{SqliteTable, StorageError, Table, TableWrite};

const FIRST_MODIFIED_MS: i64 = 1_700_000_000_000;

fn internal(e: StorageError) -> TransportError {
    TransportError::Rejected {
        status: 500,
        message: e.to_string(),
    }
}

fn not_found(what: impl std::fmt::Display) -> TransportError {
    TransportError::Rejected {
        status: 404,
        message: format!("{what} not found"),
    }
}

/// In-process stand-in for the resolution service, backed by its own table.
///
/// Every row it writes gets a fresh `LastModifiedTime` and every comment it
/// touches has its `ResolutionCount` recomputed from the rows it holds.
pub struct FakeServer {
    table: SqliteTable,
    modified_ms: i64,
    /// Refuse writes whose staleness token is older than the ballot's data.
    pub reject_stale: bool,
}

impl FakeServer {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            table: SqliteTable::open_in_memory()?,
            modified_ms: FIRST_MODIFIED_MS,
            reject_stale: false,
        })
    }

    pub fn table(&self) -> &SqliteTable {
        &self.table
    }

    /// Store rows as they are, stamping any that have never been modified.
    pub fn seed(&mut self, rows: &[Row]) -> Result<(), StorageError> {
        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.clone();
            if row.last_modified().is_none() {
                row.set(keys::LAST_MODIFIED, FieldValue::Integer(self.tick()));
            }
            writes.push(TableWrite::Put(row));
        }
        self.table.apply(&writes)
    }

    /// Change a row behind the client's back, as another writer would.
    pub fn touch(&mut self, row_id: RowId, key: &str, value: FieldValue) -> Result<(), StorageError> {
        let stamp = self.tick();
        self.table.apply(&[TableWrite::set_fields(
            row_id,
            [
                (key.to_string(), value),
                (keys::LAST_MODIFIED.to_string(), FieldValue::Integer(stamp)),
            ],
        )])
    }

    fn tick(&mut self) -> i64 {
        self.modified_ms += 1;
        self.modified_ms
    }

    pub fn handle(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.check_fresh(request)?;
        match request {
            Request::FetchRows { scope_id } => Ok(Response::new(
                EffectKind::FetchRows,
                self.table.rows_for_ballot(*scope_id).map_err(internal)?,
            )),
            Request::UpdateComments { updates, .. } => self.update_comments(updates),
            Request::DeleteComments { ids, .. } => self.delete_comments(ids),
            Request::CreateResolutions { rows, .. } => self.create_resolutions(rows),
            Request::UpdateResolutions { updates, .. } => self.update_resolutions(updates),
            Request::DeleteResolutions { ids, .. } => self.delete_resolutions(ids),
        }
    }

    fn check_fresh(&self, request: &Request) -> Result<(), TransportError> {
        if !self.reject_stale || request.kind() == EffectKind::FetchRows {
            return Ok(());
        }
        let latest = self
            .table
            .max_last_modified(request.scope_id())
            .map_err(internal)?;
        match (latest, request.modified_since()) {
            (Some(latest), Some(token)) if token < latest => {}
            (Some(_), None) => {}
            _ => return Ok(()),
        }
        Err(TransportError::Rejected {
            status: 409,
            message: "data modified since".into(),
        })
    }

    fn stamped(&mut self, row_id: RowId, changes: &Fields) -> TableWrite {
        let stamp = self.tick();
        let mut fields = changes.clone();
        fields.insert(keys::LAST_MODIFIED.into(), FieldValue::Integer(stamp));
        TableWrite::set_fields(row_id, fields)
    }

    /// Rewrite `ResolutionCount` on every row of each comment and return the rows.
    fn recount(&mut self, comment_ids: &BTreeSet<CommentId>) -> Result<Vec<Row>, TransportError> {
        let mut writes = Vec::new();
        for comment_id in comment_ids {
            let rows = self.table.rows_for_comment(*comment_id).map_err(internal)?;
            let count = rows.len() as i64;
            for row in &rows {
                if row.get(keys::RESOLUTION_COUNT) != Some(&FieldValue::Integer(count)) {
                    let mut changes = Fields::new();
                    changes.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(count));
                    writes.push(self.stamped(row.id, &changes));
                }
            }
        }
        self.table.apply(&writes).map_err(internal)?;

        let mut rows = Vec::new();
        for comment_id in comment_ids {
            rows.extend(self.table.rows_for_comment(*comment_id).map_err(internal)?);
        }
        Ok(rows)
    }

    fn update_comments(&mut self, updates: &[Update<CommentId>]) -> Result<Response, TransportError> {
        let mut writes = Vec::new();
        let mut touched = BTreeSet::new();
        for update in updates {
            let rows = self.table.rows_for_comment(update.id).map_err(internal)?;
            if rows.is_empty() {
                return Err(not_found(format!("comment {}", update.id)));
            }
            for row in &rows {
                writes.push(self.stamped(row.id, &update.changes));
            }
            touched.insert(update.id);
        }
        self.table.apply(&writes).map_err(internal)?;
        let rows = self.recount(&touched)?;
        Ok(Response::new(EffectKind::UpdateComments, rows))
    }

    fn delete_comments(&mut self, ids: &[CommentId]) -> Result<Response, TransportError> {
        let mut removed = Vec::new();
        for comment_id in ids {
            let rows = self.table.rows_for_comment(*comment_id).map_err(internal)?;
            removed.extend(rows.iter().map(|r| r.id));
        }
        let writes: Vec<TableWrite> = removed.iter().copied().map(TableWrite::Remove).collect();
        self.table.apply(&writes).map_err(internal)?;
        let mut response = Response::new(EffectKind::DeleteComments, Vec::new());
        response.deleted = removed;
        Ok(response)
    }

    fn create_resolutions(&mut self, rows: &[Row]) -> Result<Response, TransportError> {
        // Ids taken per comment, including rows created earlier in this request.
        let mut taken: BTreeMap<CommentId, BTreeSet<u32>> = BTreeMap::new();
        let mut writes = Vec::new();
        let mut deleted = Vec::new();
        for row in rows {
            if !taken.contains_key(&row.comment_id) {
                let siblings = self.table.rows_for_comment(row.comment_id).map_err(internal)?;
                if siblings.is_empty() {
                    return Err(not_found(format!("comment {}", row.comment_id)));
                }
                for placeholder in siblings.iter().filter(|r| r.is_placeholder()) {
                    writes.push(TableWrite::Remove(placeholder.id));
                    deleted.push(placeholder.id);
                }
                taken.insert(
                    row.comment_id,
                    siblings.iter().filter_map(Row::resolution_id).collect(),
                );
            }
            let Some(ids) = taken.get_mut(&row.comment_id) else {
                continue;
            };

            let resolution_id = match row.resolution_id() {
                Some(rid) if !ids.contains(&rid) => rid,
                _ => (0..).find(|n| !ids.contains(n)).unwrap_or(0),
            };
            ids.insert(resolution_id);
            let mut created = row.clone();
            created.set(keys::RESOLUTION_ID, FieldValue::Integer(resolution_id.into()));
            created.set(keys::LAST_MODIFIED, FieldValue::Integer(self.tick()));
            writes.push(TableWrite::Put(created));
        }
        self.table.apply(&writes).map_err(internal)?;

        let touched: BTreeSet<CommentId> = taken.into_keys().collect();
        let rows = self.recount(&touched)?;
        let mut response = Response::new(EffectKind::CreateResolutions, rows);
        response.deleted = deleted;
        Ok(response)
    }

    fn update_resolutions(&mut self, updates: &[Update<RowId>]) -> Result<Response, TransportError> {
        let mut writes = Vec::new();
        let mut updated = Vec::new();
        for update in updates {
            if self.table.get(update.id).map_err(internal)?.is_none() {
                return Err(not_found(format!("resolution {}", update.id)));
            }
            writes.push(self.stamped(update.id, &update.changes));
            updated.push(update.id);
        }
        self.table.apply(&writes).map_err(internal)?;

        let mut rows = Vec::with_capacity(updated.len());
        for row_id in updated {
            if let Some(row) = self.table.get(row_id).map_err(internal)? {
                rows.push(row);
            }
        }
        Ok(Response::new(EffectKind::UpdateResolutions, rows))
    }

    fn delete_resolutions(&mut self, ids: &[RowId]) -> Result<Response, TransportError> {
        let mut touched = BTreeSet::new();
        for row_id in ids {
            let row = self
                .table
                .get(*row_id)
                .map_err(internal)?
                .ok_or_else(|| not_found(format!("resolution {row_id}")))?;
            touched.insert(row.comment_id);
        }
        let writes: Vec<TableWrite> = ids.iter().copied().map(TableWrite::Remove).collect();
        self.table.apply(&writes).map_err(internal)?;

        let rows = self.recount(&touched)?;
        let mut response = Response::new(EffectKind::DeleteResolutions, rows);
        response.deleted = ids.to_vec();
        Ok(response)
    }
}
