//! In-memory writer and channel-backed claim for unit tests
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    decoder::{Row, Value},
    error::{Error, Result},
    model::ModelDescriptor,
    schema::{self, IndexInfo},
    sink::{Claim, ClaimEvent, InboundMessage},
    writer::{InsertMode, InsertPlan, Writer, WriterKind},
};

/// One statement worth of rows accepted by [MemoryWriter]
#[derive(Debug, Clone)]
pub struct RecordedInsert {
    pub table: String,
    pub mode: InsertMode,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RecordedInsert {
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

type FailWhen = Box<dyn Fn(&[Row]) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    attempts: usize,
    inserts: Vec<RecordedInsert>,
    tables: HashMap<String, Vec<Row>>,
    statements: Vec<String>,
    failing_statements: usize,
    columns: HashMap<String, Vec<String>>,
    indexes: HashMap<(String, String), IndexInfo>,
    closed: bool,
}

pub struct MemoryWriter {
    kind: WriterKind,
    datasource: String,
    unique_key: &'static [&'static str],
    fail_when: Option<FailWhen>,
    state: Mutex<State>,
}

impl MemoryWriter {
    pub fn new(kind: WriterKind) -> MemoryWriter {
        MemoryWriter {
            kind,
            datasource: String::from("memory"),
            unique_key: &[],
            fail_when: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn named(mut self, datasource: &str) -> Self {
        self.datasource = datasource.to_owned();
        self
    }

    /// Rejects every insert whose rows match `predicate`
    pub fn fail_when(mut self, predicate: impl Fn(&[Row]) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Rejects the next `n` executed statements
    pub fn fail_statements(self, n: usize) -> Self {
        self.state.lock().unwrap().failing_statements = n;
        self
    }

    /// `REPLACE` inserts drop stored rows sharing these columns
    pub fn with_unique_key(mut self, columns: &'static [&'static str]) -> Self {
        self.unique_key = columns;
        self
    }

    pub fn set_table_columns(&self, table: &str, columns: Vec<String>) {
        self.state
            .lock()
            .unwrap()
            .columns
            .insert(table.to_owned(), columns);
    }

    pub fn set_index(&self, table: &str, index: &str, info: IndexInfo) {
        self.state
            .lock()
            .unwrap()
            .indexes
            .insert((table.to_owned(), index.to_owned()), info);
    }

    /// Successful inserts, one entry per statement
    pub fn inserts(&self) -> Vec<RecordedInsert> {
        self.state.lock().unwrap().inserts.clone()
    }

    /// Insert calls, failed ones included
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn table(&self, name: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn same_key(&self, a: &Row, b: &Row) -> bool {
        let get = |row: &Row, column: &str| {
            row.iter()
                .find(|(k, _)| k == column)
                .map(|(_, v)| v.clone())
        };
        self.unique_key.iter().all(|c| get(a, c) == get(b, c))
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    fn kind(&self) -> WriterKind {
        self.kind
    }

    fn datasource(&self) -> &str {
        &self.datasource
    }

    async fn auto_migrate(&self, model: &ModelDescriptor) -> Result<()> {
        schema::auto_migrate(self, model).await
    }

    async fn insert(
        &self,
        model: &ModelDescriptor,
        rows: Vec<Row>,
        mode: InsertMode,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if self.fail_when.as_ref().is_some_and(|f| f(&rows)) {
            return Err(Error::Statement(String::from("rejected by memory writer")));
        }

        let plan = InsertPlan::new(model, rows, mode);
        for group in plan.groups {
            for values in &group.rows {
                let row: Row = group.columns.iter().cloned().zip(values.iter().cloned()).collect();
                let replace = mode == InsertMode::Replace && !self.unique_key.is_empty();
                let table = state.tables.entry(plan.table.clone()).or_default();
                if replace {
                    table.retain(|stored| !self.same_key(stored, &row));
                }
                table.push(row);
            }
            state.inserts.push(RecordedInsert {
                table: plan.table.clone(),
                mode,
                columns: group.columns,
                rows: group.rows,
            });
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_statements > 0 {
            state.failing_statements -= 1;
            return Err(Error::Statement(format!("rejected by memory writer: {sql}")));
        }
        state.statements.push(sql.to_owned());
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .columns
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn index_info(&self, table: &str, index: &str) -> Result<Option<IndexInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .indexes
            .get(&(table.to_owned(), index.to_owned()))
            .cloned())
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Offsets marked through a [ChannelClaim], one map per mark
#[derive(Clone, Default)]
pub struct Marks(Arc<Mutex<Vec<HashMap<(String, i32), i64>>>>);

impl Marks {
    pub fn all(&self) -> Vec<HashMap<(String, i32), i64>> {
        self.0.lock().unwrap().clone()
    }
}

pub struct ClaimSender {
    tx: UnboundedSender<Result<ClaimEvent>>,
    queued: Arc<AtomicUsize>,
}

impl ClaimSender {
    fn send(&self, event: ClaimEvent) {
        self.send_result(Ok(event));
    }

    fn send_result(&self, event: Result<ClaimEvent>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.send(event).unwrap();
    }

    /// Makes the next receive fail with `error`
    pub fn error(&self, error: Error) {
        self.send_result(Err(error));
    }

    pub fn message(&self, topic: &str, partition: i32, offset: i64, payload: Vec<u8>) {
        self.send(ClaimEvent::Message(InboundMessage {
            topic: topic.to_owned(),
            partition,
            offset,
            payload: Some(payload),
        }));
    }

    pub fn rebalance(&self) {
        self.send(ClaimEvent::Rebalanced);
    }

    pub fn close(&self) {
        self.send(ClaimEvent::Closed);
    }
}

pub struct ChannelClaim {
    rx: UnboundedReceiver<Result<ClaimEvent>>,
    queued: Arc<AtomicUsize>,
    marks: Marks,
}

impl ChannelClaim {
    pub fn new() -> (ChannelClaim, ClaimSender, Marks) {
        let (tx, rx) = unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let marks = Marks::default();
        (
            ChannelClaim {
                rx,
                queued: queued.clone(),
                marks: marks.clone(),
            },
            ClaimSender { tx, queued },
            marks,
        )
    }

    /// Events sent but not received yet
    pub fn remaining(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Claim for ChannelClaim {
    async fn next_event(&mut self) -> Result<ClaimEvent> {
        match self.rx.recv().await {
            Some(event) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                event
            }
            None => Ok(ClaimEvent::Closed),
        }
    }

    fn take_rebalance(&mut self) -> bool {
        false
    }

    fn mark(&mut self, offsets: &HashMap<(String, i32), i64>) -> Result<()> {
        self.marks.0.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}
