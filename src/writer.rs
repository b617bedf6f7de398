//! Writers persist decoded rows into a datasource.
//!
//! Two MySQL backends exist: [orm] (sea-orm, datasource type `gorm-mysql`)
//! and [query] (sqlx query builder, types `xorm-mysql` and `raw`). Both turn
//! rows into an [InsertPlan] first, so omitted fields and writer-managed
//! timestamps are handled the same way whichever backend runs the insert.
pub mod orm;
pub mod query;

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::{
    decoder::{Row, Value},
    error::Result,
    model::ModelDescriptor,
    schema::IndexInfo,
};

/// Datasource type; the names are the ones used in `datasource.yaml`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum WriterKind {
    #[serde(rename = "gorm-mysql")]
    GormMysql,
    #[serde(rename = "xorm-mysql")]
    XormMysql,
    #[serde(rename = "raw")]
    Raw,
}

impl fmt::Display for WriterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriterKind::GormMysql => "gorm-mysql",
            WriterKind::XormMysql => "xorm-mysql",
            WriterKind::Raw => "raw",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Insert,
    /// `REPLACE INTO`, the row sharing a unique key is deleted first
    Replace,
}

impl InsertMode {
    pub fn verb(&self) -> &'static str {
        match self {
            InsertMode::Insert => "INSERT",
            InsertMode::Replace => "REPLACE",
        }
    }
}

#[async_trait]
pub trait Writer: Send + Sync {
    fn kind(&self) -> WriterKind;

    fn datasource(&self) -> &str;

    /// Creates the model's table or adds the columns it lacks
    async fn auto_migrate(&self, model: &ModelDescriptor) -> Result<()>;

    async fn insert(
        &self,
        model: &ModelDescriptor,
        rows: Vec<Row>,
        mode: InsertMode,
    ) -> Result<()>;

    async fn write_one(&self, model: &ModelDescriptor, row: Row) -> Result<()> {
        self.insert(model, vec![row], InsertMode::Insert).await
    }

    async fn write_batch(&self, model: &ModelDescriptor, rows: Vec<Row>) -> Result<()> {
        self.insert(model, rows, InsertMode::Insert).await
    }

    async fn execute(&self, sql: &str) -> Result<()>;

    async fn table_columns(&self, table: &str) -> Result<Vec<String>>;

    async fn index_info(&self, table: &str, index: &str) -> Result<Option<IndexInfo>>;

    async fn close(&self);
}

pub(crate) const TABLE_COLUMNS_SQL: &str = "SELECT CAST(COLUMN_NAME AS CHAR) AS column_name \
     FROM information_schema.COLUMNS WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?";

pub(crate) const INDEX_COLUMNS_SQL: &str = "SELECT CAST(COLUMN_NAME AS CHAR) AS column_name, \
     CAST(NON_UNIQUE AS SIGNED) AS non_unique FROM information_schema.STATISTICS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND INDEX_NAME = ? ORDER BY SEQ_IN_INDEX";

pub(crate) fn index_from_rows(rows: Vec<(String, i64)>) -> Option<IndexInfo> {
    let unique = rows.first()?.1 == 0;
    Some(IndexInfo {
        columns: rows.into_iter().map(|(c, _)| c).collect(),
        unique,
    })
}

/// Rows sharing one column list, rendered as a single statement
#[derive(Debug, Clone, PartialEq)]
pub struct InsertGroup {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertPlan {
    pub table: String,
    pub mode: InsertMode,
    pub groups: Vec<InsertGroup>,
}

const MANAGED_TIMESTAMPS: [&str; 2] = ["created_at", "updated_at"];

impl InsertPlan {
    /// Drops omitted columns, stamps `created_at`/`updated_at` when the model
    /// has them, and groups consecutive rows with identical column lists.
    pub fn new(model: &ModelDescriptor, rows: Vec<Row>, mode: InsertMode) -> InsertPlan {
        let now = Value::DateTime(Utc::now().naive_utc());
        let stamped: Vec<&str> = MANAGED_TIMESTAMPS
            .into_iter()
            .filter(|c| model.has_column(c))
            .collect();

        let mut groups: Vec<InsertGroup> = Vec::new();
        for row in rows {
            let mut row: Row = row
                .into_iter()
                .filter(|(k, _)| !model.is_omitted(k) && !stamped.contains(&k.as_str()))
                .collect();
            if row.is_empty() {
                debug!(table = model.table_name(), "skipping row without columns");
                continue;
            }
            row.extend(stamped.iter().map(|c| (c.to_string(), now.clone())));

            let (columns, values): (Vec<String>, Vec<Value>) = row.into_iter().unzip();
            match groups.last_mut() {
                Some(group) if group.columns == columns => group.rows.push(values),
                _ => groups.push(InsertGroup {
                    columns,
                    rows: vec![values],
                }),
            }
        }

        InsertPlan {
            table: model.table_name().to_owned(),
            mode,
            groups,
        }
    }

    pub fn row_count(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, ModelDescriptor};

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn omitted_columns_never_reach_the_plan() {
        let registry = model::builtin().unwrap();
        for id in ["backup_result", "instance_event", "audit_log"] {
            let model = registry.lookup(id).unwrap();
            let rows = vec![row(&[
                ("event_type", Value::from("x")),
                ("event_uuid", Value::from("y")),
                ("cluster_type", Value::from("z")),
                ("event_cluster_type", Value::from("w")),
                ("cloud_id", Value::Int(1)),
            ])];
            let plan = InsertPlan::new(&model, rows, InsertMode::Insert);
            for group in &plan.groups {
                for omitted in model.omit_fields() {
                    assert!(!group.columns.contains(omitted), "{id}: {omitted}");
                }
            }
            assert_eq!(plan.row_count(), 1);
        }
    }

    #[test]
    fn managed_timestamps_are_overwritten() {
        let model = model::instance_event::descriptor();
        let rows = vec![row(&[
            ("created_at", Value::from("1999-01-01")),
            ("instance", Value::from("db-1")),
        ])];
        let plan = InsertPlan::new(&model, rows, InsertMode::Insert);
        let group = &plan.groups[0];
        assert_eq!(group.columns, vec!["instance", "created_at", "updated_at"]);
        assert!(matches!(group.rows[0][1], Value::DateTime(_)));
        assert_eq!(group.rows[0][1], group.rows[0][2]);
    }

    #[test]
    fn models_without_timestamps_are_not_stamped() {
        let model = ModelDescriptor::untyped("plain", vec![]).build();
        let plan = InsertPlan::new(&model, vec![row(&[("k", Value::Int(1))])], InsertMode::Insert);
        assert_eq!(plan.groups[0].columns, vec!["k"]);
    }

    #[tokio::test]
    async fn write_one_inserts_a_single_row() {
        let writer = crate::testing::MemoryWriter::new(WriterKind::XormMysql);
        let model = ModelDescriptor::untyped("plain", vec![]).build();
        writer
            .write_one(&model, row(&[("k", Value::Int(7))]))
            .await
            .unwrap();

        let inserts = writer.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].mode, InsertMode::Insert);
        assert_eq!(inserts[0].value(0, "k"), Some(&Value::Int(7)));
        assert_eq!(writer.table("plain"), vec![row(&[("k", Value::Int(7))])]);
    }

    #[test]
    fn heterogeneous_rows_split_into_groups() {
        let model = ModelDescriptor::untyped("plain", vec![]).build();
        let rows = vec![
            row(&[("a", Value::Int(1))]),
            row(&[("a", Value::Int(2))]),
            row(&[("a", Value::Int(3)), ("b", Value::Int(3))]),
            row(&[]),
        ];
        let plan = InsertPlan::new(&model, rows, InsertMode::Replace);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].rows.len(), 2);
        assert_eq!(plan.groups[1].columns, vec!["a", "b"]);
        assert_eq!(plan.row_count(), 3);
        assert_eq!(plan.mode.verb(), "REPLACE");
    }

    #[test]
    fn index_rows_report_uniqueness() {
        assert_eq!(index_from_rows(vec![]), None);
        assert_eq!(
            index_from_rows(vec![("a".into(), 0), ("b".into(), 0)]),
            Some(IndexInfo {
                columns: vec!["a".into(), "b".into()],
                unique: true
            })
        );
    }

    #[test]
    fn kind_names_match_datasource_types() {
        for (name, kind) in [
            ("gorm-mysql", WriterKind::GormMysql),
            ("xorm-mysql", WriterKind::XormMysql),
            ("raw", WriterKind::Raw),
        ] {
            let parsed: WriterKind = serde_yaml::from_str(name).unwrap();
            assert_eq!(parsed, kind);
            assert_eq!(kind.to_string(), name);
        }
    }
}
