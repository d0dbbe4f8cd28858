use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::api::TokenProvider;
use crate::config::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("token file is empty: {0}")]
    EmptyTokenFile(PathBuf),
}

/// Authentication context for one run of the client.
///
/// Resolved once at startup and handed to whoever needs it; nothing else
/// reads tokens from disk.
#[derive(Debug, Clone, Default)]
pub struct Session {
    token: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.trim();
        Self {
            token: (!token.is_empty()).then(|| token.to_string()),
        }
    }

    /// An inline token wins over the token file. A missing file means an
    /// anonymous session, not an error.
    pub fn load(cfg: &SessionConfig) -> Result<Self> {
        if !cfg.token.trim().is_empty() {
            return Ok(Self::with_token(cfg.token.as_str()));
        }
        let Some(path) = cfg.token_file.as_ref() else {
            return Ok(Self::anonymous());
        };
        if !path.exists() {
            debug!("session: no token file at {}", path.display());
            return Ok(Self::anonymous());
        }
        let token = read_token(path)?;
        Ok(Self::with_token(token))
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn require(&self) -> Result<(), SessionError> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }
}

impl TokenProvider for Session {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

fn read_token(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("session: failed to read token file {}", path.display()))?;
    let token = raw.trim();
    if token.is_empty() {
        return Err(SessionError::EmptyTokenFile(path.to_path_buf()).into());
    }
    Ok(token.to_string())
}

pub fn save_token(path: &Path, token: &str) -> Result<()> {
    let token = token.trim();
    anyhow::ensure!(!token.is_empty(), "session: token is required");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("session: failed to create directory {}", parent.display()))?;
    }
    fs::write(path, format!("{token}\n"))
        .with_context(|| format!("session: failed to write token file {}", path.display()))?;
    Ok(())
}
