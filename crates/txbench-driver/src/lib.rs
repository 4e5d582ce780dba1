//! Database drivers for txbench.
//!
//! Two targets are supported, selected by the endpoint scheme:
//!
//! - `memory://<name>[?latency_us=N]`: in-process database with optimistic
//!   concurrency control, used for tests and dry runs.
//! - `postgres://...` / `postgresql://...`: PostgreSQL through `sqlx`.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use txbench_core::{BenchError, BenchResult, ConnectionConfig, Connector, TimeoutConfig};

pub use memory::{MemoryConfig, MemoryConnector, MemoryDatabase, MemoryFault, MemorySession};
pub use postgres::{PostgresConnector, PostgresSession};

/// Parsed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Named in-process database.
    Memory { name: String, latency: Duration },
    /// PostgreSQL connection URL.
    Postgres { url: String },
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> BenchResult<Self> {
        let endpoint = endpoint.trim();

        if let Some(rest) = endpoint.strip_prefix("memory://") {
            let (name, query) = match rest.split_once('?') {
                Some((name, query)) => (name, Some(query)),
                None => (rest, None),
            };
            if name.is_empty() {
                return Err(BenchError::invalid_config(
                    "memory endpoint needs a name, e.g. memory://bench",
                ));
            }

            let mut latency = Duration::ZERO;
            for pair in query.into_iter().flat_map(|q| q.split('&')) {
                match pair.split_once('=') {
                    Some(("latency_us", value)) => {
                        let micros = value.parse::<u64>().map_err(|_| {
                            BenchError::invalid_config(format!(
                                "invalid latency_us '{value}' in endpoint"
                            ))
                        })?;
                        latency = Duration::from_micros(micros);
                    }
                    _ => {
                        return Err(BenchError::invalid_config(format!(
                            "unknown memory endpoint option '{pair}'"
                        )))
                    }
                }
            }

            return Ok(Self::Memory {
                name: name.to_string(),
                latency,
            });
        }

        if endpoint.starts_with("postgres://") || endpoint.starts_with("postgresql://") {
            return Ok(Self::Postgres {
                url: endpoint.to_string(),
            });
        }

        Err(BenchError::invalid_config(format!(
            "unsupported endpoint '{endpoint}': expected memory:// or postgres://"
        )))
    }
}

/// Builds the connector for a resolved connection configuration.
pub fn connector_for(
    connection: &ConnectionConfig,
    timeouts: &TimeoutConfig,
) -> BenchResult<Arc<dyn Connector>> {
    match Endpoint::parse(&connection.endpoint)? {
        Endpoint::Memory { name, latency } => {
            let database = MemoryDatabase::open(&name, MemoryConfig { latency });
            Ok(Arc::new(MemoryConnector::new(database, &connection.prefix)))
        }
        Endpoint::Postgres { url } => Ok(Arc::new(PostgresConnector::new(
            &url,
            connection,
            timeouts.connect_timeout(),
        )?)),
    }
}
