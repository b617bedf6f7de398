//! Backup job results.
//!
//! Agents report the same backup several times while it progresses, so rows
//! are upserted on `(cluster_address, shard_value, role, backup_id)` and the
//! last report wins.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BaseEvent, Creator, Migrator, ModelDescriptor, Record};
use crate::{
    decoder::{Row, Value},
    error::Result,
    schema::{self, Column, ColumnType, IndexSpec},
    writer::{InsertMode, Writer},
};

pub const BACKUP_KEY: IndexSpec = IndexSpec::unique(
    "uniq_backup",
    &["cluster_address", "shard_value", "role", "backup_id"],
);

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupResult {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub cluster_address: String,
    pub shard_value: String,
    pub role: String,
    pub backup_id: String,
    pub status: String,
    pub backup_size: u64,
    pub start_ts: i64,
    pub finish_ts: i64,
    /// free-form agent report, stored as JSON text
    pub detail: serde_json::Value,
}

impl Record for BackupResult {
    fn columns() -> Vec<Column> {
        let mut columns = BaseEvent::columns();
        columns.extend([
            Column::new("cluster_address", ColumnType::Varchar(128)),
            Column::new("shard_value", ColumnType::Varchar(64)),
            Column::new("role", ColumnType::Varchar(16)),
            Column::new("backup_id", ColumnType::Varchar(64)),
            Column::new("status", ColumnType::Varchar(32)),
            Column::new("backup_size", ColumnType::BigUnsigned),
            Column::new("start_ts", ColumnType::BigInt),
            Column::new("finish_ts", ColumnType::BigInt),
            Column::new("detail", ColumnType::Text),
        ]);
        columns
    }

    fn base_event_mut(&mut self) -> Option<&mut BaseEvent> {
        Some(&mut self.base)
    }
}

struct BackupMigrator;

#[async_trait]
impl Migrator for BackupMigrator {
    async fn migrate(&self, model: &ModelDescriptor, writer: &dyn Writer) -> Result<()> {
        writer.auto_migrate(model).await?;
        schema::ensure_index(writer, model.table_name(), &BACKUP_KEY).await
    }
}

struct BackupUpsert;

#[async_trait]
impl Creator for BackupUpsert {
    async fn create(
        &self,
        model: &ModelDescriptor,
        rows: Vec<Row>,
        writer: &dyn Writer,
    ) -> Result<()> {
        let rows = rows.into_iter().map(encode_inline_objects).collect();
        writer.insert(model, rows, InsertMode::Replace).await
    }
}

fn encode_inline_objects(row: Row) -> Row {
    row.into_iter()
        .map(|(column, value)| match value {
            Value::Json(v) => (column, Value::Text(v.to_string())),
            v => (column, v),
        })
        .collect()
}

pub fn descriptor() -> ModelDescriptor {
    ModelDescriptor::typed::<BackupResult>("backup_result")
        .migrator(BackupMigrator)
        .creator(BackupUpsert)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::MemoryWriter, writer::WriterKind};

    fn payload(status: &str) -> Vec<u8> {
        format!(
            r#"{{"cluster_address":"10.1.1.1:3306","shard_value":"s1","role":"primary",
                "backup_id":"b-42","status":"{status}","detail":{{"files":3}},
                "event_type":"backup","event_create_ts":1}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn upsert_uses_replace_and_encodes_detail() {
        let model = descriptor();
        let writer = MemoryWriter::new(WriterKind::GormMysql);
        let row = model.decode_typed(&payload("running")).unwrap();

        model
            .creator()
            .unwrap()
            .create(&model, vec![row], &writer)
            .await
            .unwrap();

        let inserts = writer.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].mode, InsertMode::Replace);
        assert_eq!(
            inserts[0].value(0, "detail"),
            Some(&Value::Text(String::from(r#"{"files":3}"#)))
        );
        assert!(inserts[0].value(0, "event_type").is_none());
    }

    #[tokio::test]
    async fn same_key_twice_keeps_last_payload() {
        let model = descriptor();
        let writer = MemoryWriter::new(WriterKind::GormMysql).with_unique_key(BACKUP_KEY.columns);
        let creator = model.creator().unwrap();

        for status in ["running", "done"] {
            let row = model.decode_typed(&payload(status)).unwrap();
            creator.create(&model, vec![row], &writer).await.unwrap();
        }

        let table = writer.table(model.table_name());
        assert_eq!(table.len(), 1);
        assert_eq!(
            table[0].iter().find(|(k, _)| k == "status").map(|(_, v)| v),
            Some(&Value::from("done"))
        );
    }

    #[test]
    fn report_without_status_still_decodes() {
        let model = descriptor();
        let row = model
            .decode_typed(
                br#"{"cluster_address":"a","shard_value":"s","role":"r","backup_id":"1"}"#,
            )
            .unwrap();
        let status = row.iter().find(|(k, _)| k == "status").map(|(_, v)| v);
        assert_eq!(status, Some(&Value::from("")));
        let size = row.iter().find(|(k, _)| k == "backup_size").map(|(_, v)| v);
        assert_eq!(size, Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn migration_adds_unique_key() {
        let model = descriptor();
        let writer = MemoryWriter::new(WriterKind::GormMysql);
        model.migrator().unwrap().migrate(&model, &writer).await.unwrap();
        let statements = writer.statements();
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS `backup_result`"));
        assert_eq!(
            statements.last().unwrap(),
            "CREATE UNIQUE INDEX `uniq_backup` ON `backup_result` \
             (`cluster_address`, `shard_value`, `role`, `backup_id`)"
        );
    }
}
