//! Named datasources and the writers built for them.
//!
//! Writers are created on first use and cached, so datasources nobody
//! consumes into never open a connection.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    Executor, MySqlPool,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    settings::{DatasourceConfig, Dsn, PoolSettings},
    writer::{orm::OrmFactory, query::QueryFactory, Writer, WriterKind},
};

const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Builds the writer of one datasource type
#[async_trait]
pub trait WriterFactory: Send + Sync {
    async fn connect(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Writer>>;
}

/// Connection pool shape of a datasource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    pub max_open: u32,
    /// kept warm as the pool's minimum size
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
    /// pin the session time zone to UTC
    pub utc_session: bool,
}

impl PoolPolicy {
    pub fn for_kind(kind: WriterKind) -> PoolPolicy {
        match kind {
            WriterKind::GormMysql => PoolPolicy {
                max_open: 30,
                max_idle: 10,
                max_lifetime: Some(Duration::from_secs(30 * 60)),
                utc_session: true,
            },
            WriterKind::XormMysql | WriterKind::Raw => PoolPolicy {
                max_open: 2,
                max_idle: 1,
                max_lifetime: None,
                utc_session: false,
            },
        }
    }

    pub fn with_overrides(mut self, pool: &PoolSettings) -> PoolPolicy {
        if let Some(max_open) = pool.max_open {
            self.max_open = max_open.max(1);
        }
        if let Some(max_idle) = pool.max_idle {
            self.max_idle = max_idle;
        }
        if let Some(secs) = pool.max_lifetime_secs {
            self.max_lifetime = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self.max_idle = self.max_idle.min(self.max_open);
        self
    }
}

fn split_address(address: &str) -> Result<(String, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in address {address:?}")))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((address.to_owned(), DEFAULT_MYSQL_PORT)),
    }
}

fn sql_literal(value: &str) -> String {
    let numeric = value.chars().all(|c| c.is_ascii_digit() || c == '.');
    if numeric && value.parse::<f64>().is_ok() {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }
}

/// `SET SESSION` statements for the DSN's session variables
pub(crate) fn session_statements(dsn: &Dsn) -> Result<Vec<String>> {
    dsn.session_variables
        .iter()
        .map(|(name, value)| {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::Config(format!("invalid session variable name {name:?}")));
            }
            Ok(format!("SET SESSION {name} = {}", sql_literal(value)))
        })
        .collect()
}

/// Opens a MySQL pool for `datasource` shaped by `policy`
pub async fn connect_pool(datasource: &DatasourceConfig, policy: PoolPolicy) -> Result<MySqlPool> {
    let dsn = &datasource.dsn;
    let (host, port) = split_address(&dsn.address)?;
    let options = MySqlConnectOptions::new()
        .host(&host)
        .port(port)
        .username(&dsn.user)
        .password(&dsn.password)
        .database(&dsn.database)
        .charset(&dsn.charset)
        .timezone(policy.utc_session.then(|| String::from("+00:00")));

    let statements = Arc::new(session_statements(dsn)?);
    info!(
        datasource = %datasource.name,
        kind = %datasource.kind,
        dsn = ?dsn,
        max_open = policy.max_open,
        "connecting"
    );
    let pool = MySqlPoolOptions::new()
        .max_connections(policy.max_open)
        .min_connections(policy.max_idle)
        .max_lifetime(policy.max_lifetime)
        .after_connect(move |conn, _meta| {
            let statements = statements.clone();
            Box::pin(async move {
                for sql in statements.iter() {
                    (&mut *conn).execute(sql.as_str()).await?;
                }
                Ok(())
            })
        })
        .connect_with(options)
        .await?;
    Ok(pool)
}

struct Entry {
    config: DatasourceConfig,
    writer: OnceCell<Arc<dyn Writer>>,
}

/// Datasource name to writer mapping
#[derive(Default)]
pub struct DatasourceRegistry {
    factories: HashMap<WriterKind, Arc<dyn WriterFactory>>,
    entries: HashMap<String, Entry>,
}

impl DatasourceRegistry {
    pub fn new() -> DatasourceRegistry {
        DatasourceRegistry::default()
    }

    /// Registry knowing every MySQL datasource type
    pub fn with_mysql_factories() -> DatasourceRegistry {
        let mut registry = DatasourceRegistry::new();
        registry.register_factory(WriterKind::GormMysql, OrmFactory);
        registry.register_factory(WriterKind::XormMysql, QueryFactory(WriterKind::XormMysql));
        registry.register_factory(WriterKind::Raw, QueryFactory(WriterKind::Raw));
        registry
    }

    pub fn register_factory(&mut self, kind: WriterKind, factory: impl WriterFactory + 'static) {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn register(&mut self, config: DatasourceConfig) -> Result<()> {
        if !self.factories.contains_key(&config.kind) {
            return Err(Error::UnknownWriterKind(config.kind));
        }
        if self.entries.contains_key(&config.name) {
            return Err(Error::DuplicateDatasource(config.name));
        }
        debug!(datasource = %config.name, kind = %config.kind, "registered datasource");
        self.entries.insert(
            config.name.clone(),
            Entry {
                config,
                writer: OnceCell::new(),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Writer of datasource `name`, connecting on first call
    pub async fn writer(&self, name: &str) -> Result<Arc<dyn Writer>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::DatasourceNotFound(name.to_owned()))?;
        let writer = entry
            .writer
            .get_or_try_init(|| async {
                let factory = self
                    .factories
                    .get(&entry.config.kind)
                    .ok_or(Error::UnknownWriterKind(entry.config.kind))?;
                factory.connect(&entry.config).await
            })
            .await?;
        Ok(writer.clone())
    }

    /// Closes every writer opened so far
    pub async fn close_all(&self) {
        for entry in self.entries.values() {
            if let Some(writer) = entry.writer.get() {
                writer.close().await;
            }
        }
    }
}
