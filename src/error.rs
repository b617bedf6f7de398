//! Error types shared by the registries, writers and sink handlers
use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::writer::WriterKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate table identifier {0}")]
    DuplicateTableIdentifier(String),

    #[error("model {0} is not registered")]
    ModelNotFound(String),

    #[error("duplicate datasource {0}")]
    DuplicateDatasource(String),

    #[error("datasource {0} is not registered")]
    DatasourceNotFound(String),

    #[error("no writer factory registered for datasource type {0}")]
    UnknownWriterKind(WriterKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("decoding message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("building statement: {0}")]
    Statement(String),

    #[error(transparent)]
    Orm(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("{} of {total} rows failed: {}", .failures.len(), join(.failures))]
    RowsFailed {
        total: usize,
        failures: Vec<RowFailure>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The consumer cannot be used any more and must leave the group
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Kafka(rdkafka::error::KafkaError::MessageConsumptionFatal(_))
        )
    }
}

/// Single row rejected during single-row fallback
#[derive(Debug)]
pub struct RowFailure {
    pub partition: i32,
    pub offset: i64,
    pub error: Error,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.partition, self.offset, self.error)
    }
}

fn join(failures: &[RowFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_failed_lists_every_row() {
        let err = Error::RowsFailed {
            total: 10,
            failures: vec![
                RowFailure {
                    partition: 0,
                    offset: 3,
                    error: Error::Statement("duplicate entry".into()),
                },
                RowFailure {
                    partition: 1,
                    offset: 7,
                    error: Error::Statement("data too long".into()),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 of 10 rows failed: [0@3] building statement: duplicate entry; \
             [1@7] building statement: data too long"
        );
    }

    #[test]
    fn only_fatal_consumption_errors_are_fatal() {
        use rdkafka::{error::KafkaError, types::RDKafkaErrorCode};

        let fatal = Error::Kafka(KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal));
        assert!(fatal.is_fatal());
        let transient = Error::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure,
        ));
        assert!(!transient.is_fatal());
        assert!(!Error::Statement("x".into()).is_fatal());
    }
}
