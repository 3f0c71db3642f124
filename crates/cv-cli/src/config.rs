use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://userapi-codeverse.ibda.me";
pub const DEFAULT_AGENTS_URL: &str = "https://api-codeverse.ibda.me";
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://userapi-codeverse.ibda.me/ws";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const PROJECT_CONFIG_FILE: &str = ".codeverse.json";
pub const HISTORY_FILE: &str = "chat_history";

const ENV_OVERRIDES: [(&str, &str); 5] = [
    ("CODEVERSE_API_URL", "api_url"),
    ("CODEVERSE_AGENTS_URL", "agents_url"),
    ("CODEVERSE_WEBSOCKET_URL", "websocket_url"),
    ("CODEVERSE_TIMEOUT", "timeout"),
    ("CODEVERSE_MAX_RETRIES", "max_retries"),
];
const NUMERIC_KEYS: [&str; 2] = ["timeout", "max_retries"];
const CREDENTIAL_KEYS: [&str; 2] = ["token", "username"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("missing config value: {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("home directory not found")]
    NoHome,
}

/// User-level settings and stored credentials, kept as a loose JSON object
/// so unknown keys written by other tools survive a save.
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    data: Map<String, Value>,
}

impl Config {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Ok(home.join(".codeverse").join("config.json"))
    }

    /// Defaults, then the file at `path`, then `CODEVERSE_*` env overrides.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::load_file(path);
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Defaults plus the file, without env overrides. A corrupt file is
    /// logged and ignored.
    pub fn load_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut data = defaults();
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(file_data) => data.extend(file_data),
                Err(err) => warn!("config_corrupt: {}: {err}", path.display()),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("config_unreadable: {}: {err}", path.display()),
        }
        Self { path, data }
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (env_key, config_key) in ENV_OVERRIDES {
            let Some(value) = lookup(env_key) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if NUMERIC_KEYS.contains(&config_key) {
                match value.parse::<u64>() {
                    Ok(number) => {
                        self.data.insert(config_key.to_string(), Value::from(number));
                    }
                    Err(_) => warn!("config_env_ignored: {env_key}={value}"),
                }
            } else {
                self.data
                    .insert(config_key.to_string(), Value::String(value.to_string()));
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prompt history lives next to the config file.
    pub fn history_path(&self) -> PathBuf {
        match self.path.parent() {
            Some(dir) => dir.join(HISTORY_FILE),
            None => PathBuf::from(HISTORY_FILE),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.data.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn api_url(&self) -> &str {
        self.get_str("api_url").unwrap_or(DEFAULT_API_URL)
    }

    pub fn agents_url(&self) -> &str {
        self.get_str("agents_url").unwrap_or(DEFAULT_AGENTS_URL)
    }

    pub fn websocket_url(&self) -> &str {
        self.get_str("websocket_url").unwrap_or(DEFAULT_WEBSOCKET_URL)
    }

    pub fn timeout(&self) -> Duration {
        let secs = self
            .data
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs.max(1))
    }

    pub fn max_retries(&self) -> u32 {
        self.data
            .get("max_retries")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn token(&self) -> Option<&str> {
        self.get_str("token")
    }

    pub fn username(&self) -> Option<&str> {
        self.get_str("username")
    }

    pub fn is_configured(&self) -> bool {
        self.token().is_some()
    }

    pub fn clear_credentials(&mut self) {
        for key in CREDENTIAL_KEYS {
            self.data.remove(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_url", self.get_str("api_url"), &["http", "https"])?;
        check_url("agents_url", self.get_str("agents_url"), &["http", "https"])?;
        check_url("websocket_url", self.get_str("websocket_url"), &["ws", "wss"])?;
        Ok(())
    }

    /// Writes pretty JSON and restricts the file to the owner, since it
    /// holds the bearer token.
    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        restrict_permissions(&self.path);
        Ok(())
    }
}

fn defaults() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("api_url".to_string(), Value::from(DEFAULT_API_URL));
    data.insert("agents_url".to_string(), Value::from(DEFAULT_AGENTS_URL));
    data.insert("websocket_url".to_string(), Value::from(DEFAULT_WEBSOCKET_URL));
    data.insert("timeout".to_string(), Value::from(DEFAULT_TIMEOUT_SECS));
    data.insert("max_retries".to_string(), Value::from(DEFAULT_MAX_RETRIES));
    data
}

fn check_url(key: &'static str, value: Option<&str>, schemes: &[&str]) -> Result<(), ConfigError> {
    let value = value.ok_or(ConfigError::Missing(key))?;
    let url = Url::parse(value).map_err(|err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("config_chmod_failed: {}: {err}", path.display());
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub description: String,
    pub version: String,
    pub created: String,
    #[serde(default)]
    pub agents: ProjectAgents,
    #[serde(default)]
    pub sync: ProjectSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAgents {
    #[serde(default)]
    pub preferred: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
}

impl Default for ProjectAgents {
    fn default() -> Self {
        Self {
            preferred: vec![
                "code_generator".to_string(),
                "code_reviewer".to_string(),
                "debugger".to_string(),
            ],
            excluded: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSync {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for ProjectSync {
    fn default() -> Self {
        Self {
            include: ["*.py", "*.js", "*.ts", "*.md", "*.txt"]
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
            exclude: ["node_modules", "__pycache__", ".git", "*.pyc"]
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
        }
    }
}

impl ProjectConfig {
    pub fn new(root: &Path, name: Option<String>, description: Option<String>) -> Self {
        let name = name.filter(|value| !value.trim().is_empty()).unwrap_or_else(|| {
            root.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "codeverse-project".to_string())
        });
        Self {
            name,
            description: description
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "A CodeVerse project".to_string()),
            version: "1.0.0".to_string(),
            created: root.display().to_string(),
            agents: ProjectAgents::default(),
            sync: ProjectSync::default(),
        }
    }

    pub fn load(root: &Path) -> Option<Self> {
        let path = root.join(PROJECT_CONFIG_FILE);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!("project_config_corrupt: {}: {err}", path.display());
                None
            }
        }
    }

    pub fn write(&self, root: &Path) -> Result<PathBuf, ConfigError> {
        let path = root.join(PROJECT_CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
