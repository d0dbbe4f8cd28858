use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "FEEDROLL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            page_size: default_page_size(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    crate::api::DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("feedroll/{}", crate::VERSION)
}

fn default_page_size() -> u32 {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_notice_ttl", with = "humantime_serde")]
    pub notice_ttl: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            notice_ttl: default_notice_ttl(),
        }
    }
}

fn default_notice_ttl() -> Duration {
    Duration::from_secs(2)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_token_file")]
    pub token_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            token_file: default_token_file(),
        }
    }
}

fn default_token_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("feedroll").join("token"))
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.api.base_url.is_empty() {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.is_empty() {
        base.api.user_agent = other.api.user_agent;
    }
    if other.api.page_size != 0 {
        base.api.page_size = other.api.page_size;
    }
    if !other.api.timeout.is_zero() {
        base.api.timeout = other.api.timeout;
    }

    if !other.feed.notice_ttl.is_zero() {
        base.feed.notice_ttl = other.feed.notice_ttl;
    }

    if !other.session.token.is_empty() {
        base.session.token = other.session.token;
    }
    if other.session.token_file.is_some() {
        base.session.token_file = other.session.token_file;
    }

    base
}

/// Overlays `<PREFIX>_SECTION__KEY` variables onto `cfg`; values that fail to
/// parse are ignored.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.api.page_size = parsed;
            }
        }
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "feed.notice_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.notice_ttl = duration;
            }
        }
        "session.token" => cfg.session.token = value,
        "session.token_file" => cfg.session.token_file = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("feedroll").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("FEEDROLL_TEST_DEFAULTS".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.page_size, 10);
        assert_eq!(cfg.api.base_url, crate::api::DEFAULT_BASE_URL);
        assert_eq!(cfg.feed.notice_ttl, Duration::from_secs(2));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "api:\n  base_url: https://feed.example.com/\n  page_size: 20\nfeed:\n  notice_ttl: 5s\n",
        )
        .unwrap();

        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("FEEDROLL_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.base_url, "https://feed.example.com/");
        assert_eq!(cfg.api.page_size, 20);
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        assert_eq!(cfg.feed.notice_ttl, Duration::from_secs(5));
    }

    #[test]
    fn zero_durations_in_file_keep_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "api:\n  timeout: 0s\nfeed:\n  notice_ttl: 0s\n").unwrap();

        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("FEEDROLL_TEST_ZERO".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        assert_eq!(cfg.feed.notice_ttl, Duration::from_secs(2));
    }

    #[test]
    fn env_overrides() {
        env::set_var("FEEDROLL_TEST_ENV_API__PAGE_SIZE", "15");
        env::set_var("FEEDROLL_TEST_ENV_FEED__NOTICE_TTL", "500ms");
        env::set_var("FEEDROLL_TEST_ENV_API__TIMEOUT", "not a duration");
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("FEEDROLL_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.page_size, 15);
        assert_eq!(cfg.feed.notice_ttl, Duration::from_millis(500));
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        env::remove_var("FEEDROLL_TEST_ENV_API__PAGE_SIZE");
        env::remove_var("FEEDROLL_TEST_ENV_FEED__NOTICE_TTL");
        env::remove_var("FEEDROLL_TEST_ENV_API__TIMEOUT");
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "api: [unclosed").unwrap();
        let err = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("FEEDROLL_TEST_BAD".into()),
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("config.yaml"));
    }
}
