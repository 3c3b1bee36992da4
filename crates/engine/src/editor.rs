use ballotdesk_core::{
    field_value::FieldValue,
    ids::RowId,
    row::{self, Row},
};

use crate::debounce::Debounce;
use crate::merge::{self, Buffer, Changes};

/// The in-progress edit over the current selection.
///
/// `saved` is the baseline the last flush was computed against and `edited`
/// holds every keystroke since. Neither is ever written back from the table,
/// so a rollback leaves both untouched.
#[derive(Debug, Clone)]
pub struct EditBuffer {
    rows: Vec<RowId>,
    saved: Buffer,
    edited: Buffer,
    debounce: Debounce,
}

impl EditBuffer {
    pub fn open(rows: &[Row], quiet_ms: u64) -> Self {
        let fields: Vec<_> = rows.iter().map(row::display_fields).collect();
        let saved = merge::merge_tagged(&fields);
        Self {
            rows: rows.iter().map(|r| r.id).collect(),
            edited: saved.clone(),
            saved,
            debounce: Debounce::new(quiet_ms),
        }
    }

    pub fn rows(&self) -> &[RowId] {
        &self.rows
    }

    pub fn saved(&self) -> &Buffer {
        &self.saved
    }

    pub fn edited(&self) -> &Buffer {
        &self.edited
    }

    pub fn is_dirty(&self) -> bool {
        self.saved != self.edited
    }

    pub fn is_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    pub fn set(&mut self, key: &str, value: FieldValue, now_ms: u64) {
        self.edited.set(key, value);
        self.debounce.touch(now_ms);
    }

    pub fn set_path(&mut self, path: &[&str], value: FieldValue, now_ms: u64) {
        self.edited.set_path(path, value);
        self.debounce.touch(now_ms);
    }

    pub fn take_due(&mut self, now_ms: u64) -> bool {
        self.debounce.take_due(now_ms)
    }

    /// Diff and advance the baseline. The caller dispatches the result.
    pub fn take_changes(&mut self) -> Changes {
        self.debounce.cancel();
        let changes = merge::diff(&self.saved, &self.edited);
        self.saved = self.edited.clone();
        changes
    }

    pub fn cancel(&mut self) {
        self.debounce.cancel();
        self.edited = self.saved.clone();
    }

    /// Point the buffer at `new` wherever it tracked `old`.
    pub fn replace_row(&mut self, old: RowId, new: RowId) {
        for id in &mut self.rows {
            if *id == old {
                *id = new;
            }
        }
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(RowId) -> bool) {
        self.rows.retain(|id| keep(*id));
    }
}
