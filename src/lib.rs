//! ## db-event-consumer
//! Service for real-time ingestion of JSON events from Kafka into MySQL.
//!
//! ## Installation
//! Just use cargo.
//!
//! ## Configuration
//! The main config (`config/config.yaml` by default) holds logging, Kafka
//! connection and health endpoint settings:
//! ```yaml
//! log:
//!   level: info
//!   format: json
//! kafka_info:
//!   cluster_config: { domain_name: localhost, port: 9092 }
//!   auth_info: { username: sinker, password: secret, sasl_mechanisms: SCRAM-SHA-512 }
//! ```
//! Every `data.*.yaml` file next to it lists topic bindings:
//! ```yaml
//! - topic: instance_event
//!   model_table: instance_event     # registered model identifier
//!   datasource: events              # datasource name from datasource.yaml
//!   group_id_suffix: sink           # group id is "instance_event_sink"
//!   sink_batch_size: 10
//! ```
//! and `datasource.yaml` describes the databases:
//! ```yaml
//! - name: events
//!   type: gorm-mysql                # or xorm-mysql, raw
//!   dsn: { user: root, password: pw, address: "127.0.0.1:3306", database: ops }
//! ```
//!
//! ## Extending
//! Destination tables are described by models. A typed model is a [Record]
//! decoded strictly from the payload; an untyped one writes payloads as
//! maps filtered to its declared columns. Models may bring their own
//! [Migrator] and [Creator] to replace schema migration and batch insert.
//!
//! Refer to [backup_result] for a model with both hooks, and register new
//! models in [builtin].
//!
//! [Record]: model::Record
//! [Migrator]: model::Migrator
//! [Creator]: model::Creator
//! [backup_result]: model::backup_result
//! [builtin]: model::builtin
//!
//! ## Kafka and MySQL
//! Every binding gets its own consumer group and task. Messages are written
//! in batches of at most ten and offsets are only stored once the batch is
//! in the database, so delivery is at-least-once. On `gorm-mysql`
//! datasources a failed batch is retried row by row; rows failing on their
//! own are logged and skipped so one bad record cannot stall the partition.

pub mod datasource;
pub mod decoder;
pub mod error;
pub mod health;
pub mod logging;
pub mod model;
pub mod schema;
pub mod settings;
pub mod sink;
pub mod supervisor;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;
