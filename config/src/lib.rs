//! Configuration loading for Quill.
//!
//! The file lives at `~/.quill/config.toml`. Every key is optional; a
//! missing file means defaults.

use std::env;
use std::path::{Path, PathBuf};

use quill_lsp::LspConfig;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct QuillConfig {
    pub lsp: Option<LspConfig>,
}

/// Replace `${VAR}` with the variable's value (empty if unset).
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + len];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

/// Expand a leading `~` and any `${VAR}` in a configured path.
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_env_vars(&path.to_string_lossy()));
    let Ok(rest) = expanded.strip_prefix("~") else {
        return expanded;
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => {
            tracing::warn!("No home directory; leaving {} unexpanded", expanded.display());
            expanded
        }
    }
}

impl QuillConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match config_path() {
                Some(path) => (path, false),
                None => {
                    tracing::debug!("No home directory; using default config");
                    return Ok(Self::default());
                }
            },
        };

        if !explicit && !path.exists() {
            tracing::debug!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config: Self =
            toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        config.expand();
        Ok(config)
    }

    fn expand(&mut self) {
        if let Some(lsp) = &mut self.lsp {
            lsp.command = expand_env_vars(&lsp.command);
            lsp.log_path = lsp.log_path.as_deref().map(expand_path);
        }
    }

    /// The language server configuration, defaults filled in.
    #[must_use]
    pub fn lsp(&self) -> LspConfig {
        self.lsp.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quill").join("config.toml"))
}
