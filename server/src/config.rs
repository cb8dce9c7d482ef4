//! Server configuration, loadable from a TOML file with per-section defaults.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub game: GameConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Number of database worker threads pulling from the shared job queue.
    pub worker_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Server-wide salt mixed into every password hash alongside the
    /// per-account salt.
    pub password_salt: String,
    /// Iteration count of the password hash chain.
    pub hash_iterations: u32,
    /// Output length of the password digest in bytes, at most 32.
    pub hash_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// Seconds between state snapshots sent to each client.
    pub broadcast_interval: f32,
    /// Milliseconds a destroyed player waits before respawning.
    pub respawn_cooldown_ms: u64,
    /// Minimum milliseconds between two shots from the same player.
    pub shoot_cooldown_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            game: GameConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2049,
            max_clients: 100,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { worker_count: 2 }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            password_salt: "utopia".to_string(),
            hash_iterations: 10_000,
            hash_length: 32,
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            broadcast_interval: 1.0 / 30.0,
            respawn_cooldown_ms: 5_000,
            shoot_cooldown_ms: 500,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file. Missing sections and fields
    /// fall back to their defaults.
    pub fn load(path: &Path) -> Result<ServerConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.network.port, 2049);
        assert_eq!(config.game.respawn_cooldown_ms, 5_000);
        assert_eq!(config.game.shoot_cooldown_ms, 500);
        assert!((config.game.broadcast_interval - 1.0 / 30.0).abs() < 1e-9);
        assert_eq!(config.security.hash_length, 32);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [network]
            port = 4242

            [game]
            respawn_cooldown_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 4242);
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.game.respawn_cooldown_ms, 1000);
        assert_eq!(config.game.shoot_cooldown_ms, 500);
        assert_eq!(config.database.worker_count, 2);
    }
}
