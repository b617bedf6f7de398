//! Application config.
//!
//! The main config file carries the `log`, `kafka_info` and `health`
//! sections. Topic bindings live next to it in `data.*.yaml` files and the
//! datasources in a separate `datasource.yaml`; both are plain YAML lists.
use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use config::{Config, Environment, File, FileFormat};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    writer::WriterKind,
};

pub const DEFAULT_FETCH_MIN_BYTES: i32 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: String::from("info"),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub domain_name: String,
    pub port: u16,
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthInfo {
    pub username: String,
    pub password: String,
    /// `SCRAM-SHA-512`, anything else means PLAIN
    pub sasl_mechanisms: String,
    pub security_protocol: String,
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("username", &self.username)
            .field("password", &"****")
            .field("sasl_mechanisms", &self.sasl_mechanisms)
            .field("security_protocol", &self.security_protocol)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaInfo {
    pub cluster_config: ClusterConfig,
    #[serde(default)]
    pub auth_info: AuthInfo,
}

impl KafkaInfo {
    pub fn brokers(&self) -> String {
        format!(
            "{}:{}",
            self.cluster_config.domain_name, self.cluster_config.port
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub listen: SocketAddr,
}

impl Default for HealthSettings {
    fn default() -> Self {
        HealthSettings {
            listen: SocketAddr::from(([127, 0, 0, 1], 8002)),
        }
    }
}

/// configuration of single topic sinker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicBinding {
    /// topic to consume
    pub topic: String,
    /// identifier of the registered model the topic is written as
    pub model_table: String,
    /// do not migrate the destination table on session setup
    #[serde(default)]
    pub skip_migrate_schema: bool,
    #[serde(default)]
    pub client_id_suffix: String,
    #[serde(default)]
    pub group_id_suffix: String,
    /// rewind every partition to its beginning when first claimed
    #[serde(default)]
    pub from_beginning: bool,
    /// default: 1024
    #[serde(default)]
    pub fetch_min_bytes: i32,
    /// flush threshold, capped at the handler's batch cap (default: the cap)
    #[serde(default)]
    pub sink_batch_size: usize,
    /// name of the datasource in datasource.yaml
    pub datasource: String,
}

impl TopicBinding {
    pub fn client_id(&self) -> String {
        format!("{}{}", self.topic, self.client_id_suffix)
    }

    pub fn group_id(&self) -> String {
        format!("{}_{}", self.topic, self.group_id_suffix)
    }

    pub fn fetch_min_bytes(&self) -> i32 {
        if self.fetch_min_bytes > 0 {
            self.fetch_min_bytes
        } else {
            DEFAULT_FETCH_MIN_BYTES
        }
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (field, value) in [
            ("topic", &self.topic),
            ("model_table", &self.model_table),
            ("datasource", &self.datasource),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!(
                    "{}: sinker for topic {:?} has empty {field}",
                    path.display(),
                    self.topic
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize)]
pub struct Dsn {
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// `host:port`, port defaults to 3306
    pub address: String,
    pub database: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default)]
    pub session_variables: BTreeMap<String, String>,
}

fn default_charset() -> String {
    String::from("utf8mb4")
}

impl fmt::Debug for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mysql://{}:****@{}/{}?charset={}",
            self.user, self.address, self.database, self.charset
        )
    }
}

/// Connection pool overrides; unset values keep the datasource type's defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_open: Option<u32>,
    pub max_idle: Option<u32>,
    /// zero means connections are never recycled
    pub max_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WriterKind,
    pub dsn: Dsn,
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Deserialize)]
struct MainConfig {
    #[serde(default)]
    log: LogSettings,
    kafka_info: KafkaInfo,
    #[serde(default)]
    health: HealthSettings,
}

#[derive(Debug)]
pub struct Settings {
    pub log: LogSettings,
    pub kafka_info: KafkaInfo,
    pub health: HealthSettings,
    pub sinkers: Vec<TopicBinding>,
    pub datasources: Vec<DatasourceConfig>,
}

impl Settings {
    /// Loads the main config, every `data.*.yaml` beside it and the datasource file
    pub fn new(cfgfile: &Path, datasource_file: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(cfgfile).format(FileFormat::Yaml).required(true))
            .add_source(
                Environment::with_prefix("DBEC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let main: MainConfig = cfg.try_deserialize()?;

        let dir = match cfgfile.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let sinkers = load_sinkers(dir)?;
        let datasources = load_datasources(datasource_file)?;

        Ok(Settings {
            log: main.log,
            kafka_info: main.kafka_info,
            health: main.health,
            sinkers,
            datasources,
        })
    }
}

fn read_yaml_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&content).map_err(|source| Error::Yaml {
        path: path.to_owned(),
        source,
    })
}

fn is_sinker_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("data.") && n.ends_with(".yaml"))
}

/// Reads all sinker files of `dir`; a repeated `(topic, group_id_suffix)` is an error
pub fn load_sinkers(dir: &Path) -> Result<Vec<TopicBinding>> {
    let entries = std::fs::read_dir(dir).map_err(|source| Error::Io {
        path: dir.to_owned(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_sinker_file(p))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(Error::Config(format!(
            "no data.*.yaml sinker files in {}",
            dir.display()
        )));
    }

    let mut seen = HashSet::new();
    let mut sinkers = Vec::new();
    for file in files {
        let bindings: Vec<TopicBinding> = read_yaml_list(&file)?;
        info!(file = %file.display(), bindings = bindings.len(), "loaded sinker file");
        for binding in bindings {
            binding.validate(&file)?;
            if !seen.insert((binding.topic.clone(), binding.group_id_suffix.clone())) {
                return Err(Error::Config(format!(
                    "{}: duplicate sinker for topic {:?} with group_id_suffix {:?}",
                    file.display(),
                    binding.topic,
                    binding.group_id_suffix
                )));
            }
            sinkers.push(binding);
        }
    }
    Ok(sinkers)
}

pub fn load_datasources(path: &Path) -> Result<Vec<DatasourceConfig>> {
    let datasources: Vec<DatasourceConfig> = read_yaml_list(path)?;
    let mut names = HashSet::new();
    for ds in &datasources {
        if !names.insert(ds.name.as_str()) {
            return Err(Error::DuplicateDatasource(ds.name.clone()));
        }
    }
    Ok(datasources)
}
