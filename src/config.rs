//! Engine and location settings, read from a TOML file.

use crate::vm::Limits;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    pub location: LocationConfig,
}

/// Settings shared by every render of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum depth of the argument stack.
    pub arg_stack: usize,
    /// Maximum depth of the call and scope stack.
    pub code_stack: usize,
    /// Capacity of the syscall table.
    pub max_handlers: usize,
    /// Instructions one render may execute.
    pub steps_limit: u64,
    /// Size of one output chunk.
    pub page_size: usize,
    /// Total output bytes per render, 0 for unlimited.
    pub output_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            arg_stack: limits.arg_stack,
            code_stack: limits.code_stack,
            max_handlers: 100,
            steps_limit: limits.steps_limit,
            page_size: crate::output::DEFAULT_PAGE_SIZE,
            output_limit: 0,
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            arg_stack: self.arg_stack,
            code_stack: self.code_stack,
            steps_limit: self.steps_limit,
        }
    }
}

/// Settings of one rendering location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocationConfig {
    pub enabled: bool,
    /// Body buffer size when the response has no Content-Length.
    pub data_buffer: usize,
    /// Verify the CRC of templates streamed ahead of the body.
    pub templates_check: bool,
    /// Base directory for relative template names.
    pub templates_root: PathBuf,
    /// Response header naming the template, matched case-insensitively.
    pub templates_header: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Load `template` once at setup instead of per request.
    pub cached: bool,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_buffer: 16 * 1024,
            templates_check: false,
            templates_root: PathBuf::from("/etc/ctpp/templates"),
            templates_header: "x-template".to_string(),
            template: None,
            cached: false,
        }
    }
}

impl LocationConfig {
    /// Absolute names are used as-is, relative ones are joined to
    /// `templates_root`.
    pub fn resolve_template(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.templates_root.join(path)
        }
    }

    /// Path of the configured template, if any.
    pub fn template_path(&self) -> Option<PathBuf> {
        self.template.as_deref().map(|name| self.resolve_template(name))
    }

    /// Body buffer size for a response with the given Content-Length.
    pub fn body_capacity(&self, content_length: Option<usize>) -> usize {
        content_length.unwrap_or(self.data_buffer)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("engine.arg_stack", self.engine.arg_stack),
            ("engine.code_stack", self.engine.code_stack),
            ("engine.max_handlers", self.engine.max_handlers),
            ("engine.page_size", self.engine.page_size),
            ("location.data_buffer", self.location.data_buffer),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.engine.steps_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.steps_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.location.templates_header.is_empty() {
            return Err(ConfigError::Invalid {
                key: "location.templates_header",
                reason: "must not be empty".to_string(),
            });
        }
        if self.location.cached && self.location.template.is_none() {
            return Err(ConfigError::Invalid {
                key: "location.cached",
                reason: "requires `template`".to_string(),
            });
        }
        Ok(())
    }
}
