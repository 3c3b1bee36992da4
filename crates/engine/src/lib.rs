pub mod config;
pub mod debounce;
pub mod editor;
pub mod error;
pub mod merge;
pub mod outbox;
pub mod resolutions;
pub mod router;
pub mod transport;

pub use config::EngineConfig;
pub use editor::EditBuffer;
pub use error::EngineError;
pub use merge::{Buffer, Changes, Merged, is_multiple};
pub use resolutions::{Mutation, ResolutionRequest};
pub use transport::{Transport, TransportError};

use std::collections::BTreeMap;

use ballotdesk_core::{
    clock::Clock,
    effects::{EffectKind, Request, Response, Update},
    field_value::FieldValue,
    ids::*,
    row::{self, Row},
};
use ballotdesk_storage::{SqliteTable, Table};
use tracing::{debug, info};

use crate::outbox::Outbox;

pub struct Engine<X: Transport, C: Clock> {
    table: SqliteTable,
    transport: X,
    clock: C,
    config: EngineConfig,
    outbox: Outbox,
    selection: Vec<RowId>,
    editor: Option<EditBuffer>,
    /// Placeholders absorbed by a create still in flight, as `(placeholder, new row)`.
    absorbed: BTreeMap<MutationId, Vec<(RowId, RowId)>>,
}

impl<X: Transport, C: Clock> Engine<X, C> {
    pub fn new(table: SqliteTable, transport: X, clock: C, config: EngineConfig) -> Self {
        Self {
            table,
            transport,
            clock,
            config,
            outbox: Outbox::new(),
            selection: Vec::new(),
            editor: None,
            absorbed: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &SqliteTable {
        &self.table
    }

    pub fn transport(&self) -> &X {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut X {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn selection(&self) -> &[RowId] {
        &self.selection
    }

    pub fn editor(&self) -> Option<&EditBuffer> {
        self.editor.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.outbox.len()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn row(&self, row_id: RowId) -> Result<Option<Row>, EngineError> {
        Ok(self.table.get(row_id)?)
    }

    pub fn rows(&self, ballot_id: BallotId) -> Result<Vec<Row>, EngineError> {
        Ok(self.table.rows_for_ballot(ballot_id)?)
    }

    pub fn rows_for_comment(&self, comment_id: CommentId) -> Result<Vec<Row>, EngineError> {
        Ok(self.table.rows_for_comment(comment_id)?)
    }

    /// Read one field with the derived keys resolved.
    pub fn field(&self, row_id: RowId, key: &str) -> Result<FieldValue, EngineError> {
        let row = self.table.get(row_id)?.ok_or(EngineError::RowNotFound(row_id))?;
        Ok(row::field(&row, key))
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    /// Ask for the ballot's rows. The local slice is replaced when the
    /// response settles.
    pub fn load_ballot(&mut self, ballot_id: BallotId) -> Result<MutationId, EngineError> {
        debug!(ballot_id = %ballot_id, "fetching ballot");
        self.outbox.submit(
            &mut self.table,
            &mut self.transport,
            Request::FetchRows { scope_id: ballot_id },
            &[],
        )
    }

    // ========================================================================
    // Selection & Editing
    // ========================================================================

    /// Change the selection. Pending edits are flushed first and the edit
    /// buffer is rebuilt from the new rows.
    pub fn select(&mut self, ids: &[RowId]) -> Result<(), EngineError> {
        for id in ids {
            if self.table.get(*id)?.is_none() {
                return Err(EngineError::RowNotFound(*id));
            }
        }
        let flushed = self.flush();
        self.set_selection(ids.to_vec())?;
        flushed.map(|_| ())
    }

    pub fn edit(&mut self, key: &str, value: FieldValue) -> Result<(), EngineError> {
        if row::is_read_only(key) {
            return Err(EngineError::ReadOnlyField(key.to_string()));
        }
        let now = self.clock.now_ms();
        self.open_editor()?.set(key, value, now);
        Ok(())
    }

    /// Edit one leaf inside a nested object field.
    pub fn edit_path(&mut self, path: &[&str], value: FieldValue) -> Result<(), EngineError> {
        let Some(head) = path.first() else {
            return Err(EngineError::InvalidRequest("empty field path".into()));
        };
        if row::is_read_only(head) {
            return Err(EngineError::ReadOnlyField(head.to_string()));
        }
        let now = self.clock.now_ms();
        self.open_editor()?.set_path(path, value, now);
        Ok(())
    }

    /// Flush if the quiet period since the last edit has passed.
    pub fn poll(&mut self) -> Result<Vec<MutationId>, EngineError> {
        let now = self.clock.now_ms();
        let due = self
            .editor
            .as_mut()
            .is_some_and(|editor| editor.take_due(now));
        if due { self.flush() } else { Ok(Vec::new()) }
    }

    /// Dispatch everything edited since the last flush. The baseline advances
    /// even if a dispatch fails; the first failure is returned after the rest
    /// have been attempted.
    pub fn flush(&mut self) -> Result<Vec<MutationId>, EngineError> {
        let Some(editor) = self.editor.as_mut() else {
            return Ok(Vec::new());
        };
        let changes = editor.take_changes();
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        for id in editor.rows().to_vec() {
            if let Some(row) = self.table.get(id)? {
                rows.push(row);
            }
        }
        let routed = router::route(&changes, &rows);
        info!(
            fields = changes.len(),
            comments = routed.comments.len(),
            resolutions = routed.resolutions.len(),
            materialize = routed.materialize.len(),
            "flushing edits"
        );

        let mut tickets = Vec::new();
        let mut first_error = None;
        let mut record = |result: Result<Vec<MutationId>, EngineError>| match result {
            Ok(issued) => tickets.extend(issued),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        };

        if !routed.comments.is_empty() {
            record(self.update_comments(&routed.comments));
        }
        if !routed.resolutions.is_empty() {
            record(self.update_resolutions(&routed.resolutions));
        }
        if !routed.materialize.is_empty() {
            let requests: Vec<ResolutionRequest> =
                routed.materialize.into_iter().map(|(_, request)| request).collect();
            record(self.create(&requests).map(|(issued, _)| issued));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(tickets),
        }
    }

    /// Discard edits made since the last flush.
    pub fn cancel_edits(&mut self) {
        if let Some(editor) = self.editor.as_mut() {
            editor.cancel();
        }
    }

    pub fn close_editor(&mut self) -> Result<(), EngineError> {
        let flushed = self.flush();
        self.editor = None;
        flushed.map(|_| ())
    }

    // ========================================================================
    // Resolution Lifecycle
    // ========================================================================

    /// Create resolutions and select them. Returns the new row ids. The
    /// selection stays as it was when nothing was created.
    pub fn add_resolutions(
        &mut self,
        requests: &[ResolutionRequest],
    ) -> Result<Vec<RowId>, EngineError> {
        let flushed = self.flush();
        let (_, created) = self.create(requests)?;
        if !created.is_empty() {
            self.set_selection(created.clone())?;
        }
        flushed.map(|_| created)
    }

    pub fn delete_resolutions(&mut self, ids: &[RowId]) -> Result<(), EngineError> {
        let flushed = self.flush();
        let plan = resolutions::plan_delete(&self.table, ids)?;
        let submitted = self.submit_all(plan.mutations);
        self.set_selection(plan.selection)?;
        submitted?;
        flushed.map(|_| ())
    }

    pub fn delete_selected(&mut self) -> Result<(), EngineError> {
        let flushed = self.flush();
        if self.selection.is_empty() {
            return Err(EngineError::NoSelection);
        }
        let ids = self.selection.clone();
        self.delete_resolutions(&ids)?;
        flushed.map(|_| ())
    }

    pub fn update_resolutions(
        &mut self,
        updates: &[Update<RowId>],
    ) -> Result<Vec<MutationId>, EngineError> {
        let mutations = resolutions::plan_update_resolutions(&self.table, updates)?;
        self.submit_all(mutations)
    }

    pub fn update_comments(
        &mut self,
        updates: &[Update<CommentId>],
    ) -> Result<Vec<MutationId>, EngineError> {
        let mutations = resolutions::plan_update_comments(&self.table, updates)?;
        self.submit_all(mutations)
    }

    /// Remove whole comments and drop their rows from the selection.
    pub fn delete_comments(
        &mut self,
        comment_ids: &[CommentId],
    ) -> Result<Vec<MutationId>, EngineError> {
        let (mutations, removed) = resolutions::plan_delete_comments(&self.table, comment_ids)?;
        let submitted = self.submit_all(mutations);
        self.selection.retain(|id| !removed.contains(id));
        if let Some(editor) = self.editor.as_mut() {
            editor.retain_rows(|id| !removed.contains(&id));
        }
        submitted
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Deliver the outcome of the request sent under `ticket`.
    pub fn settle(
        &mut self,
        ticket: MutationId,
        outcome: Result<Response, TransportError>,
    ) -> Result<EffectKind, EngineError> {
        let result = self.outbox.settle(&mut self.table, ticket, outcome);
        // A commit that failed to write stays in flight with its placeholders.
        if !self.outbox.contains(ticket)
            && let Some(pairs) = self.absorbed.remove(&ticket)
            && matches!(result, Err(EngineError::MutationFailed { .. }))
        {
            self.restore_placeholders(&pairs);
        }
        self.prune_selection()?;
        result
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn open_editor(&mut self) -> Result<&mut EditBuffer, EngineError> {
        if self.editor.is_none() {
            if self.selection.is_empty() {
                return Err(EngineError::NoSelection);
            }
            let rows = self.load_rows(&self.selection)?;
            self.editor = Some(EditBuffer::open(&rows, self.config.debounce_ms));
        }
        self.editor.as_mut().ok_or(EngineError::NoSelection)
    }

    fn load_rows(&self, ids: &[RowId]) -> Result<Vec<Row>, EngineError> {
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.table.get(*id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn set_selection(&mut self, ids: Vec<RowId>) -> Result<(), EngineError> {
        let rows = self.load_rows(&ids)?;
        self.selection = rows.iter().map(|r| r.id).collect();
        self.editor = if rows.is_empty() {
            None
        } else {
            Some(EditBuffer::open(&rows, self.config.debounce_ms))
        };
        Ok(())
    }

    /// Drop selected rows that no longer exist locally.
    fn prune_selection(&mut self) -> Result<(), EngineError> {
        let mut gone = Vec::new();
        for id in &self.selection {
            if self.table.get(*id)?.is_none() {
                gone.push(*id);
            }
        }
        if let Some(editor) = self.editor.as_ref() {
            for id in editor.rows() {
                if !gone.contains(id) && self.table.get(*id)?.is_none() {
                    gone.push(*id);
                }
            }
        }
        if gone.is_empty() {
            return Ok(());
        }
        self.selection.retain(|id| !gone.contains(id));
        if let Some(editor) = self.editor.as_mut() {
            editor.retain_rows(|id| !gone.contains(&id));
        }
        Ok(())
    }

    fn restore_placeholders(&mut self, pairs: &[(RowId, RowId)]) {
        for (placeholder, created) in pairs {
            for id in &mut self.selection {
                if id == created {
                    *id = *placeholder;
                }
            }
            if let Some(editor) = self.editor.as_mut() {
                editor.replace_row(*created, *placeholder);
            }
        }
    }

    /// Plan and submit creates. Absorbed placeholders are swapped for their new
    /// rows in the selection and edit buffer, and swapped back if the create
    /// fails.
    fn create(
        &mut self,
        requests: &[ResolutionRequest],
    ) -> Result<(Vec<MutationId>, Vec<RowId>), EngineError> {
        let plan = resolutions::plan_create(&self.table, requests)?;
        let mut tickets = Vec::new();
        let mut first_error = None;

        for mutation in plan.mutations {
            let pairs: Vec<(RowId, RowId)> = match &mutation.request {
                Request::CreateResolutions { rows, .. } => plan
                    .absorbed
                    .iter()
                    .filter(|(_, created)| rows.iter().any(|r| r.id == *created))
                    .copied()
                    .collect(),
                _ => Vec::new(),
            };
            match self.outbox.submit(
                &mut self.table,
                &mut self.transport,
                mutation.request,
                &mutation.writes,
            ) {
                Ok(ticket) => {
                    for (placeholder, created) in &pairs {
                        for id in &mut self.selection {
                            if id == placeholder {
                                *id = *created;
                            }
                        }
                        if let Some(editor) = self.editor.as_mut() {
                            editor.replace_row(*placeholder, *created);
                        }
                    }
                    if !pairs.is_empty() {
                        self.absorbed.insert(ticket, pairs);
                    }
                    tickets.push(ticket);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok((tickets, plan.created)),
        }
    }

    fn submit_all(&mut self, mutations: Vec<Mutation>) -> Result<Vec<MutationId>, EngineError> {
        let mut tickets = Vec::new();
        let mut first_error = None;
        for mutation in mutations {
            match self.outbox.submit(
                &mut self.table,
                &mut self.transport,
                mutation.request,
                &mutation.writes,
            ) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(tickets),
        }
    }
}
