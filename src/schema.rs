//! Destination table shapes and the generic MySQL migrations built on them
use tracing::{debug, info, warn};

use crate::{error::Result, model::ModelDescriptor, writer::Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// `BIGINT UNSIGNED AUTO_INCREMENT`, always the primary key
    AutoId,
    DateTime,
    BigInt,
    BigUnsigned,
    Int,
    Bool,
    Double,
    Varchar(u16),
    Text,
}

impl ColumnType {
    fn sql(&self) -> String {
        match self {
            ColumnType::AutoId => String::from("BIGINT UNSIGNED NOT NULL AUTO_INCREMENT"),
            ColumnType::DateTime => String::from("DATETIME(3) NULL"),
            ColumnType::BigInt => String::from("BIGINT NOT NULL DEFAULT 0"),
            ColumnType::BigUnsigned => String::from("BIGINT UNSIGNED NOT NULL DEFAULT 0"),
            ColumnType::Int => String::from("INT NOT NULL DEFAULT 0"),
            ColumnType::Bool => String::from("TINYINT(1) NOT NULL DEFAULT 0"),
            ColumnType::Double => String::from("DOUBLE NOT NULL DEFAULT 0"),
            ColumnType::Varchar(n) => format!("VARCHAR({n}) NOT NULL DEFAULT ''"),
            ColumnType::Text => String::from("TEXT NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl Column {
    pub const fn new(name: &'static str, ty: ColumnType) -> Column {
        Column { name, ty }
    }

    pub fn definition(&self) -> String {
        format!("{} {}", quote_ident(self.name), self.ty.sql())
    }
}

/// Secondary index a migrator wants to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

impl IndexSpec {
    pub const fn unique(name: &'static str, columns: &'static [&'static str]) -> IndexSpec {
        IndexSpec {
            name,
            columns,
            unique: true,
        }
    }

    pub const fn secondary(name: &'static str, columns: &'static [&'static str]) -> IndexSpec {
        IndexSpec {
            name,
            columns,
            unique: false,
        }
    }

    fn matches(&self, existing: &IndexInfo) -> bool {
        existing.unique == self.unique
            && existing.columns.len() == self.columns.len()
            && existing
                .columns
                .iter()
                .zip(self.columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    pub fn create_sql(&self, table: &str) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(self.name),
            quote_ident(table),
            columns
        )
    }
}

/// Index as reported by the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub columns: Vec<String>,
    pub unique: bool,
}

pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub fn create_table_sql(table: &str, columns: &[Column]) -> String {
    let mut defs: Vec<String> = columns.iter().map(Column::definition).collect();
    if let Some(pk) = columns.iter().find(|c| c.ty == ColumnType::AutoId) {
        defs.push(format!("PRIMARY KEY ({})", quote_ident(pk.name)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        quote_ident(table),
        defs.join(", ")
    )
}

/// Creates the table of `model` or adds the columns it is missing.
/// Existing columns are never altered and no foreign keys are created.
pub async fn auto_migrate(writer: &dyn Writer, model: &ModelDescriptor) -> Result<()> {
    let table = model.table_name();
    let columns = model.columns();
    if columns.is_empty() {
        warn!(table, "model declares no columns, skipping migration");
        return Ok(());
    }
    writer.execute(&create_table_sql(table, columns)).await?;

    let existing = writer.table_columns(table).await?;
    for column in columns {
        if existing.iter().any(|c| c.eq_ignore_ascii_case(column.name)) {
            continue;
        }
        info!(table, column = column.name, "adding missing column");
        writer
            .execute(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column.definition()
            ))
            .await?;
    }
    Ok(())
}

/// Makes sure index `spec` exists on `table` with exactly the wanted definition
pub async fn ensure_index(writer: &dyn Writer, table: &str, spec: &IndexSpec) -> Result<()> {
    match writer.index_info(table, spec.name).await? {
        Some(existing) if spec.matches(&existing) => {
            debug!(table, index = spec.name, "index up to date");
            return Ok(());
        }
        Some(existing) => {
            info!(
                table,
                index = spec.name,
                was = ?existing.columns,
                "index definition changed, recreating"
            );
            writer
                .execute(&format!(
                    "DROP INDEX {} ON {}",
                    quote_ident(spec.name),
                    quote_ident(table)
                ))
                .await?;
        }
        None => info!(table, index = spec.name, "creating index"),
    }
    writer.execute(&spec.create_sql(table)).await
}
