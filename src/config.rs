use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_CONTENT_CHARS: usize = 5000;
pub const TYPING_IDLE_MS: u64 = 3000;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Identity of the local user; decides which messages are "ours".
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    pub page_size: u32,
    pub max_content_chars: usize,
    pub typing_idle_ms: u64,
    pub typing_expiry_ms: u64,
    pub request_timeout_ms: u64,
    pub max_resync_pages: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_base_url: "http://localhost:3000/api".to_string(),
            user_id: String::new(),
            auth_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_content_chars: MAX_CONTENT_CHARS,
            typing_idle_ms: TYPING_IDLE_MS,
            typing_expiry_ms: TYPING_IDLE_MS,
            request_timeout_ms: 10_000,
            max_resync_pages: 50,
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: &str, user_id: &str) -> Self {
        ClientConfig {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    /// Store the token base64-encoded, the way it is persisted on disk.
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(BASE64.encode(token));
        self
    }

    pub fn token(&self) -> Option<String> {
        self.auth_token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    /// Apply `TRIPCHAT_API_URL`, `TRIPCHAT_USER_ID` and `TRIPCHAT_TOKEN` on top of the loaded values.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("TRIPCHAT_API_URL") {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(user) = std::env::var("TRIPCHAT_USER_ID") {
            self.user_id = user;
        }
        if let Ok(token) = std::env::var("TRIPCHAT_TOKEN") {
            self = self.with_token(&token);
        }
        self
    }
}

static CONFIG_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config loading/saving at a specific file. Only the first call wins.
pub fn set_config_path_override(path: PathBuf) -> bool {
    CONFIG_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("tripchat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_config_path() -> Result<PathBuf> {
    if let Some(path) = CONFIG_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("config.json"))
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved for user {} at {}", config.user_id, path.display());
    Ok(())
}

pub fn load_config_from(path: &Path) -> Result<Option<ClientConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: ClientConfig = serde_json::from_str(&contents)?;
    info!("Loaded config for user {} from {}", config.user_id, path.display());

    Ok(Some(config))
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_path()?, config)
}

/// Load the stored config (or defaults) and apply environment overrides.
pub fn load_config() -> Result<ClientConfig> {
    let stored = load_config_from(&get_config_path()?)?;
    Ok(stored.unwrap_or_default().apply_env_overrides())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_stored_encoded() {
        let config = ClientConfig::new("https://api.example.com/", "u1").with_token("secret");
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.token().as_deref(), Some("secret"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("authToken"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = ClientConfig::new("https://api.example.com", "u1").with_token("t0k3n");
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap().expect("config should exist");
        assert_eq!(loaded, config);
        assert_eq!(loaded.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_missing_file_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from(&dir.path().join("absent.json")).unwrap().is_none());

        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"userId":"u9","pageSize":50}"#).unwrap();
        let loaded = load_config_from(&path).unwrap().unwrap();
        assert_eq!(loaded.user_id, "u9");
        assert_eq!(loaded.page_size, 50);
        assert_eq!(loaded.max_content_chars, MAX_CONTENT_CHARS);
        assert_eq!(loaded.typing_idle(), Duration::from_millis(3000));
    }
}
