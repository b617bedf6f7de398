//! Operator audit trail. Producers add fields freely, so payloads are
//! written as maps restricted to the columns below.
use super::{BaseEvent, ModelDescriptor};
use crate::schema::{Column, ColumnType};

pub fn columns() -> Vec<Column> {
    let mut columns = BaseEvent::columns();
    columns.extend([
        Column::new("operator", ColumnType::Varchar(64)),
        Column::new("action", ColumnType::Varchar(64)),
        Column::new("target", ColumnType::Varchar(255)),
        Column::new("detail", ColumnType::Text),
    ]);
    columns
}

pub fn descriptor() -> ModelDescriptor {
    ModelDescriptor::untyped("audit_log", columns())
        .table_name("ops_audit_log")
        .build()
}
