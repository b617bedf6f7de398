//! Database instance lifecycle events (failover, restart, config change)
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BaseEvent, Migrator, ModelDescriptor, Record};
use crate::{
    error::Result,
    schema::{self, Column, ColumnType, IndexSpec},
    writer::Writer,
};

const BY_CLUSTER: IndexSpec =
    IndexSpec::secondary("idx_cluster_create_ts", &["cluster_address", "event_create_ts"]);

/// Absent fields decode to their zero value
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InstanceEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub cluster_address: String,
    pub instance: String,
    pub event_name: String,
    pub level: String,
    pub message: String,
}

impl Record for InstanceEvent {
    fn columns() -> Vec<Column> {
        let mut columns = BaseEvent::columns();
        columns.extend([
            Column::new("cluster_address", ColumnType::Varchar(128)),
            Column::new("instance", ColumnType::Varchar(128)),
            Column::new("event_name", ColumnType::Varchar(64)),
            Column::new("level", ColumnType::Varchar(16)),
            Column::new("message", ColumnType::Text),
        ]);
        columns
    }

    fn base_event_mut(&mut self) -> Option<&mut BaseEvent> {
        Some(&mut self.base)
    }
}

struct IndexedMigrator;

#[async_trait]
impl Migrator for IndexedMigrator {
    async fn migrate(&self, model: &ModelDescriptor, writer: &dyn Writer) -> Result<()> {
        writer.auto_migrate(model).await?;
        schema::ensure_index(writer, model.table_name(), &BY_CLUSTER).await
    }
}

pub fn descriptor() -> ModelDescriptor {
    ModelDescriptor::typed::<InstanceEvent>("instance_event")
        .migrator(IndexedMigrator)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Value;

    #[test]
    fn absent_fields_decode_to_zero_values() {
        let model = descriptor();
        let row = model
            .decode_typed(
                br#"{"cloud_id":1,"instance":"db","cluster_address":"c",
                    "event_name":"e","level":"l"}"#,
            )
            .unwrap();
        let get = |name: &str| row.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        assert_eq!(get("message"), Some(Value::from("")));
        assert_eq!(get("source_ip"), Some(Value::from("")));
        assert_eq!(get("cloud_id"), Some(Value::Int(1)));
    }
}
