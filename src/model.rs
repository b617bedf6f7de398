//! Destination models and the registry binding table identifiers to them.
//!
//! A [ModelDescriptor] says which table a topic lands in, how its payloads
//! are decoded and which columns are never written. Typed models implement
//! [Record] and are decoded strictly; untyped models are decoded as maps.
//! Per-model hooks ([Migrator], [Creator]) replace the default schema
//! migration and the default batch insert.
//!
//! If you add your own models, register them in [builtin].
pub mod audit_log;
pub mod backup_result;
pub mod base_event;
pub mod instance_event;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    decoder::{self, Decoder, Row},
    error::{Error, Result},
    schema::Column,
    writer::Writer,
};

pub use base_event::BaseEvent;

/// Typed shape of a destination table
pub trait Record: DeserializeOwned + Serialize + Send + Sync + 'static {
    /// All table columns, including the writer-managed ones
    fn columns() -> Vec<Column>;

    fn base_event_mut(&mut self) -> Option<&mut BaseEvent> {
        None
    }
}

/// Replaces the writer's generic auto-migration for a model
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn migrate(&self, model: &ModelDescriptor, writer: &dyn Writer) -> Result<()>;
}

/// Replaces the writer's batch insert for a model
#[async_trait]
pub trait Creator: Send + Sync {
    async fn create(&self, model: &ModelDescriptor, rows: Vec<Row>, writer: &dyn Writer)
        -> Result<()>;
}

pub struct ModelDescriptor {
    table_id: String,
    table_name: String,
    strict_schema: bool,
    omit_fields: Vec<String>,
    columns: Vec<Column>,
    typed: Option<Arc<dyn Decoder>>,
    map: decoder::map::Decoder,
    migrator: Option<Arc<dyn Migrator>>,
    creator: Option<Arc<dyn Creator>>,
}

impl ModelDescriptor {
    /// Strictly decoded model backed by record type `T`
    pub fn typed<T: Record>(table_id: &str) -> ModelBuilder {
        let decoder = decoder::typed::Decoder::<T>::new();
        ModelBuilder::new(table_id, T::columns(), Some(Arc::new(decoder)))
    }

    /// Map-decoded model; `columns` limits which keys are written
    pub fn untyped(table_id: &str, columns: Vec<Column>) -> ModelBuilder {
        ModelBuilder::new(table_id, columns, None)
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn strict_schema(&self) -> bool {
        self.strict_schema
    }

    pub fn omit_fields(&self) -> &[String] {
        &self.omit_fields
    }

    pub fn is_omitted(&self, column: &str) -> bool {
        self.omit_fields.iter().any(|f| f == column)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn migrator(&self) -> Option<&Arc<dyn Migrator>> {
        self.migrator.as_ref()
    }

    pub fn creator(&self) -> Option<&Arc<dyn Creator>> {
        self.creator.as_ref()
    }

    /// Decodes into the record shape; falls back to map decoding for untyped models
    pub fn decode_typed(&self, payload: &[u8]) -> Result<Row> {
        match &self.typed {
            Some(decoder) => Ok(decoder.decode(payload)?),
            None => self.decode_map(payload),
        }
    }

    pub fn decode_map(&self, payload: &[u8]) -> Result<Row> {
        Ok(self.map.decode(payload)?)
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("table_id", &self.table_id)
            .field("table_name", &self.table_name)
            .field("strict_schema", &self.strict_schema)
            .field("omit_fields", &self.omit_fields)
            .field("migrator", &self.migrator.is_some())
            .field("creator", &self.creator.is_some())
            .finish()
    }
}

pub struct ModelBuilder {
    table_id: String,
    table_name: Option<String>,
    strict_schema: bool,
    omit_fields: Vec<String>,
    columns: Vec<Column>,
    typed: Option<Arc<dyn Decoder>>,
    migrator: Option<Arc<dyn Migrator>>,
    creator: Option<Arc<dyn Creator>>,
}

impl ModelBuilder {
    fn new(table_id: &str, columns: Vec<Column>, typed: Option<Arc<dyn Decoder>>) -> ModelBuilder {
        ModelBuilder {
            table_id: table_id.to_owned(),
            table_name: None,
            strict_schema: typed.is_some(),
            omit_fields: BaseEvent::OMIT_FIELDS.iter().map(|f| f.to_string()).collect(),
            columns,
            typed,
            migrator: None,
            creator: None,
        }
    }

    /// Target table, defaults to the table identifier
    pub fn table_name(mut self, name: &str) -> Self {
        self.table_name = Some(name.to_owned());
        self
    }

    /// Turning strict schema off on a typed model writes its payloads as maps
    pub fn strict_schema(mut self, strict: bool) -> Self {
        self.strict_schema = strict && self.typed.is_some();
        self
    }

    pub fn omit_fields(mut self, fields: &[&str]) -> Self {
        self.omit_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn migrator(mut self, migrator: impl Migrator + 'static) -> Self {
        self.migrator = Some(Arc::new(migrator));
        self
    }

    pub fn creator(mut self, creator: impl Creator + 'static) -> Self {
        self.creator = Some(Arc::new(creator));
        self
    }

    pub fn build(self) -> ModelDescriptor {
        let map = decoder::map::Decoder::new(self.columns.iter().map(|c| c.name));
        ModelDescriptor {
            table_name: self.table_name.unwrap_or_else(|| self.table_id.clone()),
            table_id: self.table_id,
            strict_schema: self.strict_schema,
            omit_fields: self.omit_fields,
            columns: self.columns,
            typed: self.typed,
            map,
            migrator: self.migrator,
            creator: self.creator,
        }
    }
}

/// Table identifier to model descriptor mapping, filled before consumers start
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> ModelRegistry {
        ModelRegistry::default()
    }

    pub fn register(&mut self, model: ModelDescriptor) -> Result<()> {
        if self.models.contains_key(model.table_id()) {
            return Err(Error::DuplicateTableIdentifier(model.table_id().to_owned()));
        }
        self.models
            .insert(model.table_id().to_owned(), Arc::new(model));
        Ok(())
    }

    pub fn lookup(&self, table_id: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .get(table_id)
            .cloned()
            .ok_or_else(|| Error::ModelNotFound(table_id.to_owned()))
    }

    pub fn table_ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Registry with every model shipped with the service
pub fn builtin() -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    registry.register(backup_result::descriptor())?;
    registry.register(instance_event::descriptor())?;
    registry.register(audit_log::descriptor())?;
    Ok(registry)
}
