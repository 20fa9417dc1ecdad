//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database file.
    pub store_db: PathBuf,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_db = PathBuf::from(env::var("STORE_DB")?);
        let bind_ws = env::var("BIND_WS")?;
        Ok(Self { store_db, bind_ws })
    }
}

/// Serializes tests that touch the process environment.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in ["STORE_DB", "BIND_WS"] {
            env::remove_var(v);
        }
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("STORE_DB=/tmp/relay.db\n", "BIND_WS=127.0.0.1:8081\n"),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_db, PathBuf::from("/tmp/relay.db"));
        assert_eq!(cfg.bind_ws, "127.0.0.1:8081");
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        for v in ["STORE_DB", "BIND_WS"] {
            env::remove_var(v);
        }
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BIND_WS=127.0.0.1:8081\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_file_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        assert!(Settings::from_env("/nonexistent/.env").is_err());
    }
}
