//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile methods once they reach the threshold)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

impl JitMode {
    /// Whether this build can honor the mode with native code.
    pub fn is_enabled(self) -> bool {
        match self {
            JitMode::Off => false,
            JitMode::On | JitMode::Auto => cfg!(all(target_arch = "x86_64", feature = "jit")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Invocations before a method is compiled; 0 compiles on first call.
    pub jit_threshold: u32,
    /// Log compile events at info level instead of debug.
    pub trace_jit: bool,
    /// Operand stack slots per thread.
    pub stack_size: usize,
    /// Maximum nested method invocations.
    pub max_call_depth: usize,
    /// Initial code buffer capacity in bytes.
    pub code_buffer_size: usize,
    /// Executable pages mapped up front.
    pub initial_pages: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 0,
            trace_jit: false,
            stack_size: 4096,
            max_call_depth: 1024,
            code_buffer_size: 512,
            initial_pages: 4,
        }
    }
}

impl RuntimeConfig {
    /// Interpreter-only configuration.
    pub fn interpreter() -> Self {
        Self {
            jit_mode: JitMode::Off,
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size == 0 {
            return Err(ConfigError::Invalid("stack_size must be positive".to_string()));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid("max_call_depth must be positive".to_string()));
        }
        Ok(())
    }
}
