//! rdkafka consumer behind a [Claim]
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaResult,
    ClientContext, Message, Offset, TopicPartitionList,
};
use tracing::{info, warn};

use super::{Claim, ClaimEvent, InboundMessage};
use crate::{
    error::Result,
    settings::{KafkaInfo, TopicBinding},
};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer config of one topic binding
pub fn consumer_config(kafka: &KafkaInfo, binding: &TopicBinding) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", kafka.brokers())
        .set("group.id", binding.group_id())
        .set("client.id", binding.client_id())
        .set("partition.assignment.strategy", "roundrobin,range")
        .set("auto.offset.reset", "earliest")
        // offsets are stored after each flush and committed in the background
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "1000")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        .set("fetch.min.bytes", binding.fetch_min_bytes().to_string());

    let auth = &kafka.auth_info;
    if !auth.username.is_empty() {
        let mechanism = if auth.sasl_mechanisms.eq_ignore_ascii_case("SCRAM-SHA-512") {
            "SCRAM-SHA-512"
        } else {
            "PLAIN"
        };
        let protocol = if auth.security_protocol.is_empty() {
            "SASL_PLAINTEXT"
        } else {
            auth.security_protocol.as_str()
        };
        cfg.set("security.protocol", protocol)
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", &auth.username)
            .set("sasl.password", &auth.password);
    }
    cfg
}

/// Counts partition revocations so the sink can end its session
pub struct SinkContext {
    generation: Arc<AtomicU64>,
}

impl ClientContext for SinkContext {}

impl ConsumerContext for SinkContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = tpl.count(), "partitions revoked");
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            Rebalance::Assign(tpl) => {
                info!(partitions = tpl.count(), "partitions assigned");
            }
            Rebalance::Error(e) => {
                warn!(error = %e, "rebalance error");
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, "committing offsets");
        }
    }
}

pub struct KafkaClaim {
    consumer: StreamConsumer<SinkContext>,
    generation: Arc<AtomicU64>,
    seen_generation: u64,
    /// received while a rebalance was being reported, handed out first
    /// in the next session
    pending: Option<InboundMessage>,
    from_beginning: bool,
    rewound: HashSet<(String, i32)>,
}

impl KafkaClaim {
    /// Creates the binding's consumer and subscribes it to the topic
    pub fn subscribe(kafka: &KafkaInfo, binding: &TopicBinding) -> Result<KafkaClaim> {
        KafkaClaim::with_config(consumer_config(kafka, binding), binding)
    }

    fn with_config(config: ClientConfig, binding: &TopicBinding) -> Result<KafkaClaim> {
        let generation = Arc::new(AtomicU64::new(0));
        let consumer: StreamConsumer<SinkContext> = config
            .create_with_context(SinkContext {
                generation: generation.clone(),
            })?;
        consumer.subscribe(&[binding.topic.as_str()])?;
        info!(
            topic = %binding.topic,
            group = %binding.group_id(),
            client = %binding.client_id(),
            "subscribed"
        );
        Ok(KafkaClaim {
            consumer,
            generation,
            seen_generation: 0,
            pending: None,
            from_beginning: binding.from_beginning,
            rewound: HashSet::new(),
        })
    }

    /// Rewinds a partition the first time it is seen; true when the
    /// received message must be dropped
    fn rewind(&mut self, topic: &str, partition: i32) -> bool {
        if !self.from_beginning || !self.rewound.insert((topic.to_owned(), partition)) {
            return false;
        }
        match self
            .consumer
            .seek(topic, partition, Offset::Beginning, SEEK_TIMEOUT)
        {
            Ok(()) => {
                info!(topic, partition, "rewound partition to the beginning");
                true
            }
            Err(e) => {
                warn!(topic, partition, error = %e, "cannot rewind partition");
                false
            }
        }
    }
}

#[async_trait]
impl Claim for KafkaClaim {
    async fn next_event(&mut self) -> Result<ClaimEvent> {
        loop {
            if self.take_rebalance() {
                return Ok(ClaimEvent::Rebalanced);
            }
            let inbound = match self.pending.take() {
                Some(inbound) => inbound,
                None => {
                    let msg = self.consumer.recv().await?;
                    InboundMessage {
                        topic: msg.topic().to_owned(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        payload: msg.payload().map(<[u8]>::to_vec),
                    }
                }
            };
            // the fetch position is already past it, keep it for the next session
            if self.generation.load(Ordering::SeqCst) != self.seen_generation {
                self.pending = Some(inbound);
                continue;
            }
            if self.rewind(&inbound.topic, inbound.partition) {
                continue;
            }
            return Ok(ClaimEvent::Message(inbound));
        }
    }

    fn take_rebalance(&mut self) -> bool {
        let current = self.generation.load(Ordering::SeqCst);
        if current == self.seen_generation {
            return false;
        }
        self.seen_generation = current;
        true
    }

    fn mark(&mut self, offsets: &HashMap<(String, i32), i64>) -> Result<()> {
        let topic_map: HashMap<(String, i32), Offset> = offsets
            .iter()
            .map(|(k, o)| (k.clone(), Offset::Offset(*o)))
            .collect();
        let tpl = TopicPartitionList::from_topic_map(&topic_map)?;
        self.consumer.store_offsets(&tpl)?;
        Ok(())
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        info!("unsubscribed");
    }
}
