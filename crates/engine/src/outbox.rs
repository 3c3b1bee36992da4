use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use ballotdesk_core::{
    effects::{EffectKind, Request, Response},
    ids::*,
    row::Row,
};
use ballotdesk_storage::{StorageError, Table, TableWrite};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::merge::diff_fields;
use crate::transport::{Transport, TransportError};

/// A mutation whose network effect has not settled yet.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub kind: EffectKind,
    pub scope_id: BallotId,
    /// Inverse writes, already in the order they must be applied.
    pub rollback: Vec<TableWrite>,
}

/// Optimistic mutations awaiting their outcome, keyed by ticket.
#[derive(Debug, Default)]
pub struct Outbox {
    in_flight: BTreeMap<MutationId, InFlight>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn contains(&self, ticket: MutationId) -> bool {
        self.in_flight.contains_key(&ticket)
    }

    pub fn tickets(&self) -> impl Iterator<Item = MutationId> + '_ {
        self.in_flight.keys().copied()
    }

    /// Local apply plus network effect. Row shapes are checked and the rollback
    /// captured before anything is written; the staleness token is the ballot's
    /// latest modification time as seen just before the apply.
    pub fn submit<T: Table, X: Transport>(
        &mut self,
        table: &mut T,
        transport: &mut X,
        mut request: Request,
        writes: &[TableWrite],
    ) -> Result<MutationId, EngineError> {
        for write in writes {
            if let TableWrite::Put(row) = write {
                row.validate()?;
            }
        }

        let kind = request.kind();
        let scope_id = request.scope_id();
        request.set_modified_since(table.max_last_modified(scope_id)?);

        let rollback = capture_inverse(table, writes)?;
        table.apply(writes)?;
        debug!(kind = kind.as_str(), writes = writes.len(), "applied locally");

        let ticket = MutationId::new();
        self.in_flight.insert(
            ticket,
            InFlight {
                kind,
                scope_id,
                rollback,
            },
        );

        if let Err(source) = transport.send(ticket, &request) {
            return Err(self.roll_back(table, ticket, source));
        }
        Ok(ticket)
    }

    /// Apply the outcome of a network effect: merge the authoritative rows on
    /// success, revert the captured inverse on failure.
    pub fn settle<T: Table>(
        &mut self,
        table: &mut T,
        ticket: MutationId,
        outcome: Result<Response, TransportError>,
    ) -> Result<EffectKind, EngineError> {
        let Some(entry) = self.in_flight.get(&ticket) else {
            return Err(EngineError::UnknownMutation(ticket));
        };
        let kind = entry.kind;
        let scope_id = entry.scope_id;

        let response = match outcome.and_then(|r| check_response(kind, r)) {
            Ok(response) => response,
            Err(source) => return Err(self.roll_back(table, ticket, source)),
        };

        // The entry, and with it the rollback, is dropped only once the commit is written.
        match kind {
            EffectKind::FetchRows => {
                table.replace_ballot(scope_id, &response.rows)?;
            }
            EffectKind::UpdateComments | EffectKind::UpdateResolutions => {
                table.apply(&upserts(&response))?;
            }
            // A create may absorb a placeholder the server reports as deleted.
            EffectKind::CreateResolutions
            | EffectKind::DeleteComments
            | EffectKind::DeleteResolutions => {
                let mut writes: Vec<TableWrite> =
                    response.deleted.iter().copied().map(TableWrite::Remove).collect();
                writes.extend(upserts(&response));
                table.apply(&writes)?;
            }
        }
        self.in_flight.remove(&ticket);
        debug!(
            kind = kind.as_str(),
            rows = response.rows.len(),
            deleted = response.deleted.len(),
            "committed"
        );
        Ok(kind)
    }

    fn roll_back<T: Table>(
        &mut self,
        table: &mut T,
        ticket: MutationId,
        source: TransportError,
    ) -> EngineError {
        let Some(entry) = self.in_flight.get(&ticket) else {
            return EngineError::UnknownMutation(ticket);
        };
        let kind = entry.kind;
        warn!(kind = kind.as_str(), error = %source, "rolling back");
        if let Err(e) = table.apply(&entry.rollback) {
            return EngineError::Storage(e);
        }
        self.in_flight.remove(&ticket);
        EngineError::MutationFailed { kind, source }
    }
}

fn check_response(kind: EffectKind, response: Response) -> Result<Response, TransportError> {
    if response.kind != kind {
        return Err(TransportError::Malformed(format!(
            "expected {} response, got {}",
            kind.as_str(),
            response.kind.as_str()
        )));
    }
    for row in &response.rows {
        row.validate()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
    }
    Ok(response)
}

fn upserts(response: &Response) -> Vec<TableWrite> {
    response.rows.iter().cloned().map(TableWrite::Put).collect()
}

/// Build the writes that undo `writes` exactly, against the table as it is now.
///
/// Each write is inverted against a scratch copy of its row that already has
/// the earlier writes of the batch applied, and the inverses come back in
/// reverse order.
pub fn capture_inverse<T: Table>(
    table: &T,
    writes: &[TableWrite],
) -> Result<Vec<TableWrite>, StorageError> {
    let mut scratch: BTreeMap<RowId, Option<Row>> = BTreeMap::new();
    let mut inverse = Vec::with_capacity(writes.len());

    for write in writes {
        let row_id = write.row_id();
        let slot = match scratch.entry(row_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(table.get(row_id)?),
        };

        match (write, slot.as_ref()) {
            (TableWrite::Put(_), Some(before)) | (TableWrite::Remove(_), Some(before)) => {
                inverse.push(TableWrite::Put(before.clone()));
            }
            (TableWrite::Put(_), None) => inverse.push(TableWrite::Remove(row_id)),
            (TableWrite::Remove(_), None) => {}
            (TableWrite::Patch { .. }, Some(before)) => {
                let mut after = Some(before.clone());
                write.apply_to(&mut after);
                if let Some(after) = &after {
                    let fields = diff_fields(&after.fields, &before.fields);
                    if !fields.is_empty() {
                        inverse.push(TableWrite::Patch { row_id, fields });
                    }
                }
            }
            (TableWrite::Patch { .. }, None) => {}
        }

        write.apply_to(slot);
    }

    inverse.reverse();
    Ok(inverse)
}
