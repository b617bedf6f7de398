//! Per-binding consume loop.
//!
//! A [SinkHandler] buffers messages of one topic, decodes them with its
//! model and writes them in small batches. Offsets are only marked after the
//! batch was written, so a crash or a failed flush means redelivery, never
//! loss. The one exception is the single-row fallback of `gorm-mysql`
//! datasources: rows still failing on their own are reported and skipped.
//!
//! A session lasts from partition assignment until the next rebalance or
//! shutdown. Messages still buffered when a session ends are discarded,
//! their offsets were never marked and they will be consumed again.
pub mod batch;
pub mod kafka;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    decoder::Row,
    error::{Error, Result, RowFailure},
    model::ModelDescriptor,
    settings::TopicBinding,
    writer::{Writer, WriterKind},
};
use batch::Batch;

/// Upper bound of the buffer, whatever the binding asks for
pub const BATCH_CAP: usize = 10;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between single-row writes in fallback mode
pub const FALLBACK_PAUSE: Duration = Duration::from_millis(200);

const SETUP_BACKOFF_MIN: Duration = Duration::from_secs(1);
const SETUP_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum ClaimEvent {
    Message(InboundMessage),
    /// partitions were revoked, the session is over
    Rebalanced,
    /// no more messages will ever arrive
    Closed,
}

/// Source of messages for a sink and sink of marked offsets
#[async_trait]
pub trait Claim: Send {
    /// Next message of the session. Must be cancel safe.
    async fn next_event(&mut self) -> Result<ClaimEvent>;

    /// Reports a rebalance observed since the last call, at most once
    fn take_rebalance(&mut self) -> bool;

    /// Stores the offsets to resume from, keyed by `(topic, partition)`
    fn mark(&mut self, offsets: &HashMap<(String, i32), i64>) -> Result<()>;

    /// Leaves the group, called once when the sink stops
    fn close(&mut self) {}
}

/// How a batch is decoded and written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPath {
    /// map decode, batch insert
    Map,
    /// typed decode, batch insert
    Typed,
    /// typed decode, batch insert, then row by row if the batch fails
    TypedWithFallback,
}

impl FlushPath {
    pub fn select(strict_schema: bool, kind: WriterKind) -> FlushPath {
        match (strict_schema, kind) {
            (false, _) | (_, WriterKind::Raw) => FlushPath::Map,
            (true, WriterKind::XormMysql) => FlushPath::Typed,
            (true, WriterKind::GormMysql) => FlushPath::TypedWithFallback,
        }
    }
}

/// Flush threshold for a binding's `sink_batch_size`
pub fn batch_limit(sink_batch_size: usize) -> usize {
    if sink_batch_size > 0 {
        sink_batch_size.min(BATCH_CAP)
    } else {
        BATCH_CAP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Rebalanced,
    Shutdown,
    Closed,
}

/// Exponential backoff between failed session setups
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff {
            next: SETUP_BACKOFF_MIN,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(SETUP_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = SETUP_BACKOFF_MIN;
    }
}

struct Decoded {
    partition: i32,
    offset: i64,
    row: Row,
}

pub struct SinkHandler {
    binding: TopicBinding,
    model: Arc<ModelDescriptor>,
    writer: Arc<dyn Writer>,
    path: FlushPath,
    limit: usize,
    batch: Batch,
}

impl SinkHandler {
    pub fn new(
        binding: TopicBinding,
        model: Arc<ModelDescriptor>,
        writer: Arc<dyn Writer>,
    ) -> SinkHandler {
        let path = FlushPath::select(model.strict_schema(), writer.kind());
        let limit = batch_limit(binding.sink_batch_size);
        SinkHandler {
            binding,
            model,
            writer,
            path,
            limit,
            batch: Batch::with_capacity(limit),
        }
    }

    pub fn path(&self) -> FlushPath {
        self.path
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Runs sessions until shutdown or until the claim is closed
    pub async fn run(&mut self, claim: &mut dyn Claim, shutdown: &CancellationToken) {
        let mut backoff = Backoff::new();
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = self.setup().await {
                let delay = backoff.next_delay();
                error!(
                    topic = %self.binding.topic,
                    table = self.model.table_name(),
                    retry_in = ?delay,
                    "session setup failed: {e}"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = sleep(delay) => continue,
                }
            }
            backoff.reset();

            let end = self.consume_claim(claim, shutdown).await;
            self.cleanup();
            match end {
                SessionEnd::Rebalanced => {
                    info!(topic = %self.binding.topic, "session ended by rebalance")
                }
                SessionEnd::Shutdown | SessionEnd::Closed => return,
            }
        }
    }

    /// Migrates the destination table unless the binding opts out
    pub async fn setup(&self) -> Result<()> {
        if self.binding.skip_migrate_schema {
            debug!(table = self.model.table_name(), "schema migration skipped");
            return Ok(());
        }
        match self.model.migrator() {
            Some(migrator) => migrator.migrate(&self.model, self.writer.as_ref()).await,
            None => self.writer.auto_migrate(&self.model).await,
        }
    }

    /// Batching loop of one session
    pub async fn consume_claim(
        &mut self,
        claim: &mut dyn Claim,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let mut ticker = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let accepting = self.batch.len() < self.limit;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = ticker.tick() => {
                    if claim.take_rebalance() {
                        return SessionEnd::Rebalanced;
                    }
                    if !self.batch.is_empty() {
                        self.flush_and_mark(claim).await;
                    }
                }
                event = claim.next_event(), if accepting => match event {
                    Ok(ClaimEvent::Message(msg)) => {
                        self.batch.push(msg);
                        if self.batch.len() >= self.limit {
                            self.flush_and_mark(claim).await;
                        }
                    }
                    Ok(ClaimEvent::Rebalanced) => return SessionEnd::Rebalanced,
                    Ok(ClaimEvent::Closed) => return SessionEnd::Closed,
                    Err(e) if e.is_fatal() => {
                        error!(topic = %self.binding.topic, "consumer failed, leaving group: {e}");
                        return SessionEnd::Closed;
                    }
                    Err(e) => warn!(topic = %self.binding.topic, "receiving message: {e}"),
                },
            }
        }
    }

    /// Drops whatever the session left unflushed
    pub fn cleanup(&mut self) {
        if !self.batch.is_empty() {
            warn!(
                topic = %self.binding.topic,
                dropped = self.batch.len(),
                "discarding unflushed messages"
            );
        }
        self.batch.clear();
    }

    async fn flush_and_mark(&mut self, claim: &mut dyn Claim) {
        let rows = self.batch.len();
        match self.flush().await {
            Ok(()) => debug!(topic = %self.binding.topic, rows, "flushed"),
            Err(e @ Error::RowsFailed { .. }) => {
                error!(topic = %self.binding.topic, "skipping rows rejected in fallback: {e}")
            }
            Err(e) => {
                warn!(
                    topic = %self.binding.topic,
                    pending = rows,
                    "flush failed, retrying on next tick: {e}"
                );
                return;
            }
        }
        if let Err(e) = claim.mark(&self.batch.next_offsets()) {
            error!(topic = %self.binding.topic, "marking offsets: {e}");
        }
        self.batch.clear();
    }

    fn decode(&self) -> Result<Vec<Decoded>> {
        let mut decoded = Vec::with_capacity(self.batch.len());
        for msg in self.batch.messages() {
            let payload = match msg.payload.as_deref() {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            let row = match self.path {
                FlushPath::Map => self.model.decode_map(payload),
                FlushPath::Typed | FlushPath::TypedWithFallback => {
                    self.model.decode_typed(payload)
                }
            };
            match row {
                Ok(row) => decoded.push(Decoded {
                    partition: msg.partition,
                    offset: msg.offset,
                    row,
                }),
                Err(e) => {
                    error!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        payload = %String::from_utf8_lossy(payload),
                        "cannot decode message: {e}"
                    );
                    return Err(e);
                }
            }
        }
        Ok(decoded)
    }

    /// Decodes and writes the buffered messages
    pub async fn flush(&self) -> Result<()> {
        let decoded = self.decode()?;
        if decoded.is_empty() {
            return Ok(());
        }

        if let Some(creator) = self.model.creator() {
            let rows = decoded.into_iter().map(|d| d.row).collect();
            return creator
                .create(&self.model, rows, self.writer.as_ref())
                .await;
        }

        match self.path {
            FlushPath::Map | FlushPath::Typed => {
                let rows = decoded.into_iter().map(|d| d.row).collect();
                self.writer.write_batch(&self.model, rows).await
            }
            FlushPath::TypedWithFallback => {
                let rows = decoded.iter().map(|d| d.row.clone()).collect();
                match self.writer.write_batch(&self.model, rows).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(
                            topic = %self.binding.topic,
                            rows = decoded.len(),
                            "batch insert failed, writing rows one by one: {e}"
                        );
                        self.write_each(decoded).await
                    }
                }
            }
        }
    }

    async fn write_each(&self, decoded: Vec<Decoded>) -> Result<()> {
        let total = decoded.len();
        let mut failures = Vec::new();
        for (i, d) in decoded.into_iter().enumerate() {
            if i > 0 {
                sleep(FALLBACK_PAUSE).await;
            }
            if let Err(error) = self.writer.write_batch(&self.model, vec![d.row]).await {
                failures.push(RowFailure {
                    partition: d.partition,
                    offset: d.offset,
                    error,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::RowsFailed { total, failures })
        }
    }
}
