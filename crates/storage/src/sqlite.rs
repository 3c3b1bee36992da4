use rusqlite::{Connection, OptionalExtension};

use ballotdesk_core::{
    field_value::Fields,
    ids::*,
    row::Row,
};

use crate::error::StorageError;
use crate::traits::{Table, TableWrite};

const ROW_COLUMNS: &str = "row_id, ballot_id, comment_id, fields";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn encode_fields(fields: &Fields) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(fields).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_fields(bytes: &[u8]) -> Result<Fields, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub struct SqliteTable {
    conn: Connection,
}

impl SqliteTable {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn query_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Row>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(read_row).collect()
    }
}

fn read_row(
    (row_id, ballot_id, comment_id, fields): (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>),
) -> Result<Row, StorageError> {
    Ok(Row {
        id: RowId::from_bytes(to_array::<16>(row_id, "row_id")?),
        ballot_id: BallotId::from_bytes(to_array::<16>(ballot_id, "ballot_id")?),
        comment_id: CommentId::from_bytes(to_array::<16>(comment_id, "comment_id")?),
        fields: decode_fields(&fields)?,
    })
}

fn load_row(tx: &rusqlite::Transaction, row_id: RowId) -> Result<Option<Row>, StorageError> {
    let raw = tx
        .query_row(
            &format!("SELECT {ROW_COLUMNS} FROM comment_resolutions WHERE row_id = ?1"),
            rusqlite::params![row_id.as_bytes().as_slice()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            },
        )
        .optional()?;
    raw.map(read_row).transpose()
}

fn store_row(tx: &rusqlite::Transaction, row: &Row) -> Result<(), StorageError> {
    let comment_seq = row.comment_seq().ok_or_else(|| {
        StorageError::Serialization(format!("row {} has no CommentID", row.id))
    })?;
    tx.execute(
        "INSERT INTO comment_resolutions (row_id, ballot_id, comment_id, comment_seq, resolution_id, last_modified, fields)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(row_id) DO UPDATE SET ballot_id = excluded.ballot_id, comment_id = excluded.comment_id,
             comment_seq = excluded.comment_seq, resolution_id = excluded.resolution_id,
             last_modified = excluded.last_modified, fields = excluded.fields",
        rusqlite::params![
            row.id.as_bytes().as_slice(),
            row.ballot_id.as_bytes().as_slice(),
            row.comment_id.as_bytes().as_slice(),
            comment_seq,
            row.resolution_id().map(i64::from),
            row.last_modified(),
            encode_fields(&row.fields)?,
        ],
    )?;
    Ok(())
}

fn materialize_write(tx: &rusqlite::Transaction, write: &TableWrite) -> Result<(), StorageError> {
    match write {
        TableWrite::Put(row) => store_row(tx, row)?,

        TableWrite::Remove(row_id) => {
            tx.execute(
                "DELETE FROM comment_resolutions WHERE row_id = ?1",
                rusqlite::params![row_id.as_bytes().as_slice()],
            )?;
        }

        TableWrite::Patch { row_id, .. } => {
            let mut slot = load_row(tx, *row_id)?;
            if slot.is_some() {
                write.apply_to(&mut slot);
                if let Some(row) = slot {
                    store_row(tx, &row)?;
                }
            }
        }
    }
    Ok(())
}

impl Table for SqliteTable {
    fn get(&self, row_id: RowId) -> Result<Option<Row>, StorageError> {
        let mut rows = self.query_rows(
            &format!("SELECT {ROW_COLUMNS} FROM comment_resolutions WHERE row_id = ?1"),
            rusqlite::params![row_id.as_bytes().as_slice()],
        )?;
        Ok(rows.pop())
    }

    fn rows_for_comment(&self, comment_id: CommentId) -> Result<Vec<Row>, StorageError> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM comment_resolutions WHERE comment_id = ?1
                 ORDER BY resolution_id, row_id"
            ),
            rusqlite::params![comment_id.as_bytes().as_slice()],
        )
    }

    fn rows_for_ballot(&self, ballot_id: BallotId) -> Result<Vec<Row>, StorageError> {
        self.query_rows(
            &format!(
                "SELECT {ROW_COLUMNS} FROM comment_resolutions WHERE ballot_id = ?1
                 ORDER BY comment_seq, resolution_id, row_id"
            ),
            rusqlite::params![ballot_id.as_bytes().as_slice()],
        )
    }

    fn row_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM comment_resolutions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn max_last_modified(&self, ballot_id: BallotId) -> Result<Option<i64>, StorageError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(last_modified) FROM comment_resolutions WHERE ballot_id = ?1",
            rusqlite::params![ballot_id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    fn apply(&mut self, writes: &[TableWrite]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for write in writes {
            materialize_write(&tx, write)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_ballot(&mut self, ballot_id: BallotId, rows: &[Row]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM comment_resolutions WHERE ballot_id = ?1",
            rusqlite::params![ballot_id.as_bytes().as_slice()],
        )?;
        for row in rows {
            store_row(&tx, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn digest(&self) -> Result<[u8; 32], StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT row_id, ballot_id, comment_id, fields FROM comment_resolutions ORDER BY row_id",
        )?;
        let mut hasher = blake3::Hasher::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for column in 0..4 {
                let bytes: Vec<u8> = row.get(column)?;
                hasher.update(&(bytes.len() as u64).to_be_bytes());
                hasher.update(&bytes);
            }
        }
        Ok(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballotdesk_core::{field_value::FieldValue, row::keys};

    fn row(ballot_id: BallotId, comment_id: CommentId, seq: i64, rid: Option<i64>) -> Row {
        let mut fields = Fields::new();
        fields.insert(keys::COMMENT_SEQ.into(), FieldValue::Integer(seq));
        fields.insert(
            keys::RESOLUTION_ID.into(),
            rid.map(FieldValue::Integer).unwrap_or(FieldValue::Null),
        );
        fields.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(1));
        Row::new(RowId::new(), ballot_id, comment_id, fields)
    }

    #[test]
    fn put_get_roundtrip() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let mut r = row(BallotId::new(), CommentId::new(), 3, Some(0));
        r.set(keys::PAGE, FieldValue::Float(12.5));
        r.set("Vote", FieldValue::List(vec![FieldValue::text("No"), FieldValue::Null]));
        table.apply(&[TableWrite::Put(r.clone())])?;
        assert_eq!(table.get(r.id)?, Some(r));
        Ok(())
    }

    #[test]
    fn patch_sets_and_removes_keys() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let mut r = row(BallotId::new(), CommentId::new(), 3, Some(0));
        r.set(keys::NOTES, FieldValue::text("old"));
        table.apply(&[TableWrite::Put(r.clone())])?;

        let mut fields = std::collections::BTreeMap::new();
        fields.insert(keys::NOTES.to_string(), None);
        fields.insert(keys::PAGE.to_string(), Some(FieldValue::text("7")));
        table.apply(&[TableWrite::Patch { row_id: r.id, fields }])?;

        let stored = table.get(r.id)?.ok_or_else(|| StorageError::NotFound(r.id.to_string()))?;
        assert!(stored.get(keys::NOTES).is_none());
        assert_eq!(stored.get(keys::PAGE), Some(&FieldValue::text("7")));
        Ok(())
    }

    #[test]
    fn patch_on_missing_row_is_noop() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        table.apply(&[TableWrite::set_fields(
            RowId::new(),
            [(keys::PAGE.to_string(), FieldValue::text("1"))],
        )])?;
        assert_eq!(table.row_count()?, 0);
        Ok(())
    }

    #[test]
    fn failed_batch_applies_nothing() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let good = row(BallotId::new(), CommentId::new(), 1, Some(0));
        let mut bad = row(BallotId::new(), CommentId::new(), 2, Some(0));
        bad.fields.remove(keys::COMMENT_SEQ);

        let result = table.apply(&[TableWrite::Put(good), TableWrite::Put(bad)]);
        assert!(result.is_err());
        assert_eq!(table.row_count()?, 0);
        Ok(())
    }

    #[test]
    fn comment_rows_ordered_by_resolution_id() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let ballot_id = BallotId::new();
        let comment_id = CommentId::new();
        let r2 = row(ballot_id, comment_id, 5, Some(2));
        let r0 = row(ballot_id, comment_id, 5, Some(0));
        let r1 = row(ballot_id, comment_id, 5, Some(1));
        let other = row(ballot_id, CommentId::new(), 4, Some(0));
        table.apply(&[
            TableWrite::Put(r2.clone()),
            TableWrite::Put(r0.clone()),
            TableWrite::Put(other.clone()),
            TableWrite::Put(r1.clone()),
        ])?;

        let ids: Vec<_> = table.rows_for_comment(comment_id)?.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![r0.id, r1.id, r2.id]);

        let ids: Vec<_> = table.rows_for_ballot(ballot_id)?.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![other.id, r0.id, r1.id, r2.id]);
        Ok(())
    }

    #[test]
    fn max_last_modified_scoped_to_ballot() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let ballot_id = BallotId::new();
        assert_eq!(table.max_last_modified(ballot_id)?, None);

        let mut a = row(ballot_id, CommentId::new(), 1, Some(0));
        a.set(keys::LAST_MODIFIED, FieldValue::Integer(100));
        let mut b = row(ballot_id, CommentId::new(), 2, Some(0));
        b.set(keys::LAST_MODIFIED, FieldValue::Integer(300));
        let mut elsewhere = row(BallotId::new(), CommentId::new(), 1, Some(0));
        elsewhere.set(keys::LAST_MODIFIED, FieldValue::Integer(900));
        table.apply(&[TableWrite::Put(a), TableWrite::Put(b), TableWrite::Put(elsewhere)])?;

        assert_eq!(table.max_last_modified(ballot_id)?, Some(300));
        Ok(())
    }

    #[test]
    fn digest_ignores_insertion_order() -> Result<(), StorageError> {
        let ballot_id = BallotId::new();
        let a = row(ballot_id, CommentId::new(), 1, Some(0));
        let b = row(ballot_id, CommentId::new(), 2, Some(0));

        let mut first = SqliteTable::open_in_memory()?;
        first.apply(&[TableWrite::Put(a.clone()), TableWrite::Put(b.clone())])?;
        let mut second = SqliteTable::open_in_memory()?;
        second.apply(&[TableWrite::Put(b.clone()), TableWrite::Put(a.clone())])?;
        assert_eq!(first.digest()?, second.digest()?);

        second.apply(&[TableWrite::set_fields(
            a.id,
            [(keys::PAGE.to_string(), FieldValue::text("9"))],
        )])?;
        assert_ne!(first.digest()?, second.digest()?);
        Ok(())
    }

    #[test]
    fn replace_ballot_leaves_other_ballots() -> Result<(), StorageError> {
        let mut table = SqliteTable::open_in_memory()?;
        let ballot_id = BallotId::new();
        let stale = row(ballot_id, CommentId::new(), 1, Some(0));
        let kept = row(BallotId::new(), CommentId::new(), 1, Some(0));
        table.apply(&[TableWrite::Put(stale.clone()), TableWrite::Put(kept.clone())])?;

        let fresh = row(ballot_id, CommentId::new(), 2, Some(0));
        table.replace_ballot(ballot_id, std::slice::from_ref(&fresh))?;

        assert!(table.get(stale.id)?.is_none());
        assert!(table.get(kept.id)?.is_some());
        assert_eq!(table.rows_for_ballot(ballot_id)?, vec![fresh]);
        Ok(())
    }

    #[test]
    fn on_disk_table_persists() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rows.db");
        let path = path.to_str().ok_or("non-utf8 temp path")?;
        let r = row(BallotId::new(), CommentId::new(), 1, Some(0));
        {
            let mut table = SqliteTable::open(path)?;
            table.apply(&[TableWrite::Put(r.clone())])?;
        }
        let table = SqliteTable::open(path)?;
        assert_eq!(table.get(r.id)?, Some(r));
        Ok(())
    }
}
