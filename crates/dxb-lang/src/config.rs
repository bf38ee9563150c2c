use std::env;
use std::time::Duration;

use smol_str::SmolStr;

use crate::binary::ProtocolDataType;
use crate::value::Target;

/// Settings shared by every compile call of one [`crate::Compiler`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Blocks larger than this are split. `None` never splits.
    pub max_block_size: Option<usize>,
    pub ttl: u8,
    pub priority: u8,
    /// First id handed out to `var`/`ref`/`val`/`const` declarations.
    pub var_start: u32,
    /// How long an unused scope id keeps its counters.
    pub sid_ttl: Duration,
    /// Upper bound on parsed tokens per compile call.
    pub iteration_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_size: None,
            ttl: 64,
            priority: 0,
            var_start: 0x0100,
            sid_ttl: Duration::from_secs(60),
            iteration_limit: 500_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(size_str) = env::var("DXB_MAX_BLOCK_SIZE") {
            if let Ok(size) = size_str.parse::<usize>() {
                config.max_block_size = Some(size);
            } else {
                tracing::warn!(value = %size_str, "invalid DXB_MAX_BLOCK_SIZE, blocks stay unbounded");
            }
        }

        if let Ok(ttl_str) = env::var("DXB_TTL") {
            if let Ok(ttl) = ttl_str.parse::<u8>() {
                config.ttl = ttl;
            } else {
                tracing::warn!(value = %ttl_str, default = config.ttl, "invalid DXB_TTL, using default");
            }
        }

        if let Ok(secs_str) = env::var("DXB_SID_TTL_SECS") {
            if let Ok(secs) = secs_str.parse::<u64>() {
                config.sid_ttl = Duration::from_secs(secs);
            } else {
                tracing::warn!(
                    value = %secs_str,
                    default = config.sid_ttl.as_secs(),
                    "invalid DXB_SID_TTL_SECS, using default"
                );
            }
        }

        config
    }
}

/// Receiver of a block, with the key used to encrypt for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver {
    pub target: Target,
    pub key: Option<Vec<u8>>,
}

impl From<Target> for Receiver {
    fn from(target: Target) -> Self {
        Self { target, key: None }
    }
}

/// Per-call compile options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    pub data_type: ProtocolDataType,
    /// Sender written into the routing header; anonymous when `None`.
    pub sender: Option<Target>,
    pub receivers: Vec<Receiver>,
    /// Send to every endpoint, ignoring `receivers`.
    pub flood: bool,
    pub sign: bool,
    pub encrypt: bool,
    pub symmetric_key: Option<Vec<u8>>,
    pub sid: Option<u32>,
    pub block_index: Option<u16>,
    pub block_increment: Option<u16>,
    pub end_of_scope: bool,
    /// Overrides the executable flag derived from `data_type`.
    pub allow_execute: Option<bool>,
    pub ttl: Option<u8>,
    pub priority: Option<u8>,
    /// Plugins whose `plugin NAME (...)` blocks are compiled.
    pub plugins: Vec<SmolStr>,
    /// Plugins that must appear in the script.
    pub required_plugins: Vec<SmolStr>,
    /// Also deduplicates text and large numbers when false.
    pub no_duplicate_value_optimization: bool,
    pub collapse_pointers: bool,
    pub keep_external_pointers: bool,
    pub collapse_first_inserted: bool,
    pub keep_first_transform: bool,
    pub max_block_size: Option<usize>,
    /// Emit a full block with routing and signed header, or the bare body.
    pub add_header: bool,
    /// Values for `?` and `?n` placeholders.
    pub inserted_values: Vec<crate::value::ValueId>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            data_type: ProtocolDataType::Request,
            sender: None,
            receivers: Vec::new(),
            flood: false,
            sign: false,
            encrypt: false,
            symmetric_key: None,
            sid: None,
            block_index: None,
            block_increment: None,
            end_of_scope: true,
            allow_execute: None,
            ttl: None,
            priority: None,
            plugins: Vec::new(),
            required_plugins: Vec::new(),
            no_duplicate_value_optimization: false,
            collapse_pointers: false,
            keep_external_pointers: false,
            collapse_first_inserted: false,
            keep_first_transform: false,
            max_block_size: None,
            add_header: true,
            inserted_values: Vec::new(),
        }
    }
}

impl CompileOptions {
    /// Options for a bare body without routing or signed header.
    pub fn body_only() -> Self {
        Self {
            add_header: false,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, data_type: ProtocolDataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn plugin_enabled(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p == name) || self.required_plugins.iter().any(|p| p == name)
    }

    pub fn executable(&self) -> bool {
        self.allow_execute.unwrap_or_else(|| self.data_type.executable_by_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_block_size, None);
        assert_eq!(config.ttl, 64);
        assert_eq!(config.priority, 0);
        assert_eq!(config.var_start, 0x0100);
        assert_eq!(config.sid_ttl, Duration::from_secs(60));
        assert_eq!(config.iteration_limit, 500_000);
    }

    #[test]
    fn test_plugin_enabled() {
        let options = CompileOptions {
            plugins: vec!["a".into()],
            required_plugins: vec!["b".into()],
            ..Default::default()
        };
        assert!(options.plugin_enabled("a"));
        assert!(options.plugin_enabled("b"));
        assert!(!options.plugin_enabled("c"));
    }

    #[test]
    fn test_executable() {
        assert!(CompileOptions::default().executable());
        assert!(!CompileOptions::default().with_type(ProtocolDataType::Data).executable());
        let forced = CompileOptions {
            allow_execute: Some(true),
            data_type: ProtocolDataType::Data,
            ..Default::default()
        };
        assert!(forced.executable());
    }

    #[test]
    fn test_config_from_env() {
        let saved = ["DXB_MAX_BLOCK_SIZE", "DXB_TTL", "DXB_SID_TTL_SECS"].map(|key| (key, env::var(key).ok()));
        scopeguard::defer! {
            for (key, val) in &saved {
                unsafe {
                    match val {
                        Some(val) => env::set_var(key, val),
                        None => env::remove_var(key),
                    }
                }
            }
        }

        unsafe {
            env::set_var("DXB_MAX_BLOCK_SIZE", "2048");
            env::set_var("DXB_TTL", "not a number");
            env::set_var("DXB_SID_TTL_SECS", "5");
        }

        let config = Config::from_env();

        assert_eq!(config.max_block_size, Some(2048));
        assert_eq!(config.ttl, 64);
        assert_eq!(config.sid_ttl, Duration::from_secs(5));
    }
}
