use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Key-value configuration behind the runtime. Implementations decide where
/// values live (process environment, in-memory map).
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

/// Backed by the process environment, seeded from a `.env` file when one
/// exists. Writes go to both the environment and the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("No .env at {}, using process environment only", env_file.display());
        }

        Box::new(Self { env_file })
    }
}

/// Rewrites the `key=` line of an env file: `Some` upserts the entry, `None`
/// drops it. Lines for other keys, comments included, pass through untouched.
fn rewrite_env_line(path: &Path, key: &str, value: Option<&str>) -> std::io::Result<()> {
    let current = fs::read_to_string(path).unwrap_or_default();
    let mut lines = Vec::new();
    let mut seen = false;

    for line in current.lines() {
        if line.split_once('=').map(|(k, _)| k.trim()) == Some(key) {
            if let Some(value) = value {
                lines.push(format!("{key}={value}"));
            }
            seen = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !seen {
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
    }

    fs::write(path, lines.join("\n"))
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        rewrite_env_line(&self.env_file, key, Some(value)).map_err(|e| e.to_string())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if !self.env_file.exists() {
            return;
        }
        if let Err(e) = rewrite_env_line(&self.env_file, key, None) {
            warn!("Could not rewrite {}: {}", self.env_file.display(), e);
        }
    }
}

/// In-memory configuration for tests and embedded setups.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }
}
