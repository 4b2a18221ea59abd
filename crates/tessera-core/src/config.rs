use crate::error::{Result, TesseraError};
use crate::validator::DEFAULT_MAX_DEPTH;

/// Connection settings for [`crate::storage::PostgresStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Capacity of the channel a streamed read forwards rows through.
    pub stream_buffer: usize,
    /// Attempts for a transaction failing with a serialization error.
    pub tx_retries: u32,
}

impl StorageConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        StorageConfig {
            database_url: database_url.into(),
            max_connections: 10,
            stream_buffer: 64,
            tx_retries: 3,
        }
    }

    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("TESSERA_DATABASE_URL")
            .map_err(|_| TesseraError::Config("TESSERA_DATABASE_URL is not set".into()))?;
        let defaults = StorageConfig::new(database_url);
        Ok(StorageConfig {
            max_connections: env_parse("TESSERA_MAX_CONNECTIONS", defaults.max_connections)?,
            stream_buffer: env_parse("TESSERA_STREAM_BUFFER", defaults.stream_buffer)?,
            tx_retries: env_parse("TESSERA_TX_RETRIES", defaults.tx_retries)?,
            ..defaults
        })
    }
}

/// Request-level limits applied by [`crate::dispatch::Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Extra insert attempts after a generated id collides.
    pub insert_retries: u32,
    pub max_depth: usize,
    /// Length of generated object ids.
    pub id_length: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            insert_retries: 5,
            max_depth: DEFAULT_MAX_DEPTH,
            id_length: 10,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = DispatchConfig::default();
        Ok(DispatchConfig {
            insert_retries: env_parse("TESSERA_INSERT_RETRIES", defaults.insert_retries)?,
            max_depth: env_parse("TESSERA_MAX_DEPTH", defaults.max_depth)?,
            id_length: env_parse("TESSERA_ID_LENGTH", defaults.id_length)?,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| TesseraError::Config(format!("{name} has an invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_falls_back_and_rejects_garbage() {
        std::env::set_var("TESSERA_TEST_PARSE_OK", " 7 ");
        std::env::set_var("TESSERA_TEST_PARSE_BAD", "seven");
        assert_eq!(env_parse("TESSERA_TEST_PARSE_OK", 1u32).unwrap(), 7);
        assert_eq!(env_parse("TESSERA_TEST_PARSE_MISSING", 3usize).unwrap(), 3);
        assert!(matches!(
            env_parse("TESSERA_TEST_PARSE_BAD", 1u32),
            Err(TesseraError::Config(_))
        ));
    }

    #[test]
    fn dispatch_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert!(config.insert_retries > 0);
        assert_eq!(StorageConfig::new("postgres://x").max_connections, 10);
    }
}
