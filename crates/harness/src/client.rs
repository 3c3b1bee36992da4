use ballotdesk_core::{
    clock::ManualClock,
    effects::EffectKind,
    field_value::{FieldValue, Fields},
    ids::*,
    row::{self, Row, keys},
};
use ballotdesk_engine::{Engine, EngineConfig, EngineError, TransportError};
use ballotdesk_storage::{SqliteTable, Table};
use tempfile::TempDir;

use crate::server::FakeServer;
use crate::transport::RecordingTransport;

const START_MS: u64 = 1_000_000;

/// Rows for one imported comment. `resolutions == 0` yields the single
/// placeholder row of a comment nobody has resolved yet.
pub fn comment_rows(ballot_id: BallotId, seq: i64, resolutions: usize) -> (CommentId, Vec<Row>) {
    let comment_id = CommentId::new();
    let mut comment = Fields::new();
    comment.insert(keys::COMMENT_SEQ.into(), FieldValue::Integer(seq));
    comment.insert("Category".into(), FieldValue::text("T"));
    comment.insert("CommenterName".into(), FieldValue::text("A. Member"));
    comment.insert(keys::PAGE.into(), FieldValue::text(format!("{}", 10 + seq)));
    comment.insert(keys::CLAUSE.into(), FieldValue::text("9.2"));
    comment.insert(keys::COMMENT_GROUP.into(), FieldValue::text(""));
    comment.insert(keys::NOTES.into(), FieldValue::text(""));
    comment.insert(keys::ADHOC_GROUP.into(), FieldValue::Null);
    comment.insert(keys::LAST_MODIFIED.into(), FieldValue::Null);

    if resolutions == 0 {
        let mut fields = comment;
        fields.insert(keys::RESOLUTION_ID.into(), FieldValue::Null);
        fields.insert(keys::RESOLUTION_COUNT.into(), FieldValue::Integer(1));
        return (comment_id, vec![Row::new(RowId::new(), ballot_id, comment_id, fields)]);
    }

    let rows = (0..resolutions)
        .map(|rid| {
            let mut fields = comment.clone();
            fields.extend(row::default_resolution());
            fields.insert(keys::RESOLUTION_ID.into(), FieldValue::Integer(rid as i64));
            fields.insert(
                keys::RESOLUTION_COUNT.into(),
                FieldValue::Integer(resolutions as i64),
            );
            Row::new(RowId::new(), ballot_id, comment_id, fields)
        })
        .collect();
    (comment_id, rows)
}

/// An engine wired to a [`FakeServer`] through a [`RecordingTransport`], with
/// a hand-driven clock. Requests wait on the wire until delivered.
pub struct TestClient {
    pub engine: Engine<RecordingTransport, ManualClock>,
    pub server: FakeServer,
    pub transport: RecordingTransport,
    pub clock: ManualClock,
    pub ballot_id: BallotId,
    _dir: Option<TempDir>,
}

impl TestClient {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::build(SqliteTable::open_in_memory()?, EngineConfig::default(), None)
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        Self::build(SqliteTable::open_in_memory()?, config, None)
    }

    /// Same as [`TestClient::new`] with the local table in a temporary file.
    pub fn on_disk() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ballot.db");
        let path = path.to_str().ok_or("temp path is not valid UTF-8")?;
        let table = SqliteTable::open(path)?;
        Self::build(table, EngineConfig::default(), Some(dir))
    }

    fn build(
        table: SqliteTable,
        config: EngineConfig,
        dir: Option<TempDir>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = RecordingTransport::new();
        let clock = ManualClock::new(START_MS);
        Ok(Self {
            engine: Engine::new(table, transport.clone(), clock.clone(), config),
            server: FakeServer::new()?,
            transport,
            clock,
            ballot_id: BallotId::new(),
            _dir: dir,
        })
    }

    /// Import a comment on the server and fetch the ballot.
    pub fn add_comment(
        &mut self,
        seq: i64,
        resolutions: usize,
    ) -> Result<CommentId, Box<dyn std::error::Error>> {
        let (comment_id, rows) = comment_rows(self.ballot_id, seq, resolutions);
        self.server.seed(&rows)?;
        self.sync()?;
        Ok(comment_id)
    }

    /// Fetch the ballot and deliver the response straight away.
    pub fn sync(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let ticket = self.engine.load_ballot(self.ballot_id)?;
        self.deliver(ticket)?;
        Ok(())
    }

    /// Hand the request sent under `ticket` to the server and settle its answer.
    pub fn deliver(&mut self, ticket: MutationId) -> Result<EffectKind, EngineError> {
        let request = self
            .transport
            .take(ticket)
            .ok_or(EngineError::UnknownMutation(ticket))?;
        let outcome = self.server.handle(&request);
        self.engine.settle(ticket, outcome)
    }

    pub fn deliver_next(&mut self) -> Option<Result<EffectKind, EngineError>> {
        let (ticket, request) = self.transport.take_next()?;
        let outcome = self.server.handle(&request);
        Some(self.engine.settle(ticket, outcome))
    }

    pub fn deliver_all(&mut self) -> Vec<Result<EffectKind, EngineError>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.deliver_next() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drop the request under `ticket` and report `error` instead; the server
    /// never sees it.
    pub fn fail(&mut self, ticket: MutationId, error: TransportError) -> Result<EffectKind, EngineError> {
        self.transport.take(ticket);
        self.engine.settle(ticket, Err(error))
    }

    pub fn fail_next(&mut self, error: TransportError) -> Option<Result<EffectKind, EngineError>> {
        let (ticket, _) = self.transport.take_next()?;
        Some(self.engine.settle(ticket, Err(error)))
    }

    pub fn rows(&self) -> Result<Vec<Row>, EngineError> {
        self.engine.rows(self.ballot_id)
    }

    pub fn rows_for_comment(&self, comment_id: CommentId) -> Result<Vec<Row>, EngineError> {
        self.engine.rows_for_comment(comment_id)
    }

    /// Display ids of a comment's rows in `ResolutionID` order.
    pub fn display_ids(&self, comment_id: CommentId) -> Result<Vec<String>, EngineError> {
        Ok(self
            .rows_for_comment(comment_id)?
            .iter()
            .map(row::display_id)
            .collect())
    }

    pub fn digest(&self) -> Result<[u8; 32], EngineError> {
        Ok(self.engine.table().digest()?)
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
    }
}
