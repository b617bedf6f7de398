//! sqlx query builder writer, serves datasources of type `xorm-mysql` and `raw`
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    query_builder::Separated, Executor, MySql, MySqlPool, QueryBuilder,
};
use tracing::{debug, info};

use super::{
    index_from_rows, InsertGroup, InsertMode, InsertPlan, Writer, WriterKind, INDEX_COLUMNS_SQL,
    TABLE_COLUMNS_SQL,
};
use crate::{
    datasource::{connect_pool, PoolPolicy, WriterFactory},
    decoder::{Row, Value},
    error::Result,
    model::ModelDescriptor,
    schema::{self, quote_ident, IndexInfo},
    settings::DatasourceConfig,
};

pub struct QueryWriter {
    kind: WriterKind,
    datasource: String,
    pool: MySqlPool,
}

impl QueryWriter {
    pub fn new(kind: WriterKind, datasource: &str, pool: MySqlPool) -> QueryWriter {
        QueryWriter {
            kind,
            datasource: datasource.to_owned(),
            pool,
        }
    }
}

fn bind<'args>(b: &mut Separated<'_, 'args, MySql, &'static str>, value: Value) {
    match value {
        Value::Null => b.push_bind(None::<String>),
        Value::Bool(v) => b.push_bind(v),
        Value::Int(v) => b.push_bind(v),
        Value::UInt(v) => b.push_bind(v),
        Value::Float(v) => b.push_bind(v),
        Value::Text(v) => b.push_bind(v),
        Value::DateTime(v) => b.push_bind(v),
        Value::Json(v) => b.push_bind(v.to_string()),
    };
}

pub(crate) fn insert_builder(
    table: &str,
    mode: InsertMode,
    group: InsertGroup,
) -> QueryBuilder<'static, MySql> {
    let mut builder = QueryBuilder::new(format!("{} INTO {} (", mode.verb(), quote_ident(table)));
    {
        let mut columns = builder.separated(", ");
        for column in &group.columns {
            columns.push(quote_ident(column));
        }
    }
    builder.push(") ");
    builder.push_values(group.rows, |mut b, row| {
        for value in row {
            bind(&mut b, value);
        }
    });
    builder
}

#[async_trait]
impl Writer for QueryWriter {
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
        let plan = InsertPlan::new(model, rows, mode);
        debug!(
            datasource = %self.datasource,
            table = %plan.table,
            rows = plan.row_count(),
            "inserting"
        );
        if plan.groups.len() > 1 {
            let mut tx = self.pool.begin().await?;
            for group in plan.groups {
                insert_builder(&plan.table, plan.mode, group)
                    .build()
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        } else {
            for group in plan.groups {
                insert_builder(&plan.table, plan.mode, group)
                    .build()
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(datasource = %self.datasource, sql, "executing");
        self.pool.execute(sql).await?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(TABLE_COLUMNS_SQL)
            .bind(table)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn index_info(&self, table: &str, index: &str) -> Result<Option<IndexInfo>> {
        let rows = sqlx::query_as::<_, (String, i64)>(INDEX_COLUMNS_SQL)
            .bind(table)
            .bind(index)
            .fetch_all(&self.pool)
            .await?;
        Ok(index_from_rows(rows))
    }

    async fn close(&self) {
        info!(datasource = %self.datasource, "closing connection pool");
        self.pool.close().await;
    }
}

/// Builds [QueryWriter]s; one factory per datasource type it serves
pub struct QueryFactory(pub WriterKind);

#[async_trait]
impl WriterFactory for QueryFactory {
    async fn connect(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Writer>> {
        let policy = PoolPolicy::for_kind(self.0).with_overrides(&datasource.pool);
        let pool = connect_pool(datasource, policy).await?;
        Ok(Arc::new(QueryWriter::new(self.0, &datasource.name, pool)))
    }
}
