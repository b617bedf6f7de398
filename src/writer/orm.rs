//! sea-orm backed writer, serves datasources of type `gorm-mysql`
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    sea_query::{Alias, InsertStatement, Query, SimpleExpr},
    ConnectionTrait, DatabaseConnection, DbBackend, SqlxMySqlConnector, Statement,
    TransactionTrait, Value as DbValue,
};
use sqlx::MySqlPool;
use tracing::{debug, info};

use super::{
    index_from_rows, InsertGroup, InsertMode, InsertPlan, Writer, WriterKind, INDEX_COLUMNS_SQL,
    TABLE_COLUMNS_SQL,
};
use crate::{
    datasource::{connect_pool, PoolPolicy, WriterFactory},
    decoder::{Row, Value},
    error::{Error, Result},
    model::ModelDescriptor,
    schema::{self, IndexInfo},
    settings::DatasourceConfig,
};

pub struct OrmWriter {
    datasource: String,
    conn: DatabaseConnection,
    pool: MySqlPool,
}

impl OrmWriter {
    pub fn new(datasource: &str, pool: MySqlPool) -> OrmWriter {
        OrmWriter {
            datasource: datasource.to_owned(),
            conn: SqlxMySqlConnector::from_sqlx_mysql_pool(pool.clone()),
            pool,
        }
    }
}

fn db_value(value: Value) -> DbValue {
    match value {
        Value::Null => DbValue::String(None),
        Value::Bool(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::UInt(v) => v.into(),
        Value::Float(v) => v.into(),
        Value::Text(v) => v.into(),
        Value::DateTime(v) => v.into(),
        Value::Json(v) => v.to_string().into(),
    }
}

pub(crate) fn insert_statement(
    table: &str,
    mode: InsertMode,
    group: InsertGroup,
) -> Result<InsertStatement> {
    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(table))
        .columns(group.columns.iter().map(|c| Alias::new(c.as_str())));
    if mode == InsertMode::Replace {
        stmt.replace();
    }
    for row in group.rows {
        stmt.values(row.into_iter().map(|v| SimpleExpr::Value(db_value(v))))
            .map_err(|e| Error::Statement(e.to_string()))?;
    }
    Ok(stmt)
}

async fn run_plan<C: ConnectionTrait>(conn: &C, plan: InsertPlan) -> Result<()> {
    let backend = conn.get_database_backend();
    for group in plan.groups {
        let stmt = insert_statement(&plan.table, plan.mode, group)?;
        conn.execute(backend.build(&stmt)).await?;
    }
    Ok(())
}

#[async_trait]
impl Writer for OrmWriter {
    fn kind(&self) -> WriterKind {
        WriterKind::GormMysql
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
            let txn = self.conn.begin().await?;
            run_plan(&txn, plan).await?;
            txn.commit().await?;
            Ok(())
        } else {
            run_plan(&self.conn, plan).await
        }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        debug!(datasource = %self.datasource, sql, "executing");
        self.conn.execute_unprepared(sql).await?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::MySql,
                TABLE_COLUMNS_SQL,
                [table.into()],
            ))
            .await?;
        rows.iter()
            .map(|r| Ok(r.try_get::<String>("", "column_name")?))
            .collect()
    }

    async fn index_info(&self, table: &str, index: &str) -> Result<Option<IndexInfo>> {
        let rows = self
            .conn
            .query_all(Statement::from_sql_and_values(
                DbBackend::MySql,
                INDEX_COLUMNS_SQL,
                [table.into(), index.into()],
            ))
            .await?;
        let rows = rows
            .iter()
            .map(|r| {
                Ok((
                    r.try_get::<String>("", "column_name")?,
                    r.try_get::<i64>("", "non_unique")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(index_from_rows(rows))
    }

    async fn close(&self) {
        info!(datasource = %self.datasource, "closing connection pool");
        self.pool.close().await;
    }
}

pub struct OrmFactory;

#[async_trait]
impl WriterFactory for OrmFactory {
    async fn connect(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Writer>> {
        let policy = PoolPolicy::for_kind(WriterKind::GormMysql).with_overrides(&datasource.pool);
        let pool = connect_pool(datasource, policy).await?;
        Ok(Arc::new(OrmWriter::new(&datasource.name, pool)))
    }
}
