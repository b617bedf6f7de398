use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::schema::{Column, ColumnType};

/// Columns every typed event table starts with.
///
/// `id`, `created_at` and `updated_at` are not part of the payload: the
/// database assigns the id and the writer stamps both timestamps at insert.
/// The `event_*_ts` fields are milliseconds since epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BaseEvent {
    pub event_create_ts: i64,
    pub event_report_ts: i64,
    pub event_receive_ts: i64,
    pub cloud_id: i32,
    pub source_ip: String,
    pub business_id: i64,
}

impl BaseEvent {
    /// Envelope fields producers send that have no column
    pub const OMIT_FIELDS: [&'static str; 4] =
        ["event_cluster_type", "event_type", "cluster_type", "event_uuid"];

    pub fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::AutoId),
            Column::new("created_at", ColumnType::DateTime),
            Column::new("updated_at", ColumnType::DateTime),
            Column::new("event_create_ts", ColumnType::BigInt),
            Column::new("event_report_ts", ColumnType::BigInt),
            Column::new("event_receive_ts", ColumnType::BigInt),
            Column::new("cloud_id", ColumnType::Int),
            Column::new("source_ip", ColumnType::Varchar(64)),
            Column::new("business_id", ColumnType::BigInt),
        ]
    }

    pub(crate) fn stamp_receive_ts(&mut self) {
        if self.event_receive_ts == 0 {
            self.event_receive_ts = Utc::now().timestamp_millis();
        }
    }
}
