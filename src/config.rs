use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default kernel capture buffer size (2 MiB)
pub const DEFAULT_CAPTURE_BUFFER_SIZE: usize = 2 * 1024 * 1024;
/// Default ring buffer block size (1 MiB)
pub const DEFAULT_RING_BUFFER_BLOCK_SIZE: usize = 1024 * 1024;
/// Default number of ring buffer blocks
pub const DEFAULT_RING_BUFFER_NUM_BLOCKS: usize = 4;
/// Default cap for locally buffered packet data during rotation (64 MiB)
pub const DEFAULT_LOCAL_BUFFER_SIZE_LIMIT: usize = 64 * 1024 * 1024;
/// Default interval between scheduled rotations (seconds)
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the flow database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Seconds between scheduled rotations
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,

    /// Listen address of the status API, e.g. "127.0.0.1:6060"
    #[serde(default)]
    pub api_addr: Option<String>,

    /// Interfaces to capture on
    #[serde(default)]
    pub interfaces: HashMap<String, CaptureConfig>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/flowprobe/db")
}

fn default_rotation_interval() -> u64 {
    DEFAULT_ROTATION_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL_SECS,
            api_addr: None,
            interfaces: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowprobe/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }
}

/// Per-interface capture settings.
///
/// Equality is structural down to the ring buffer sub-fields; a capture is
/// reinitialized exactly when its stored config compares unequal to an
/// updated one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Put the interface into promiscuous mode
    #[serde(default)]
    pub promisc: bool,

    /// Kernel buffer size backing the capture, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Ring buffer geometry
    #[serde(default)]
    pub ring_buffer: RingBufferConfig,

    /// Cap for locally buffered packet data during rotation
    #[serde(default = "default_local_buffer_size_limit")]
    pub local_buffer_size_limit: usize,
}

fn default_buffer_size() -> usize {
    DEFAULT_CAPTURE_BUFFER_SIZE
}

fn default_local_buffer_size_limit() -> usize {
    DEFAULT_LOCAL_BUFFER_SIZE_LIMIT
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            promisc: false,
            buffer_size: DEFAULT_CAPTURE_BUFFER_SIZE,
            ring_buffer: RingBufferConfig::default(),
            local_buffer_size_limit: DEFAULT_LOCAL_BUFFER_SIZE_LIMIT,
        }
    }
}

/// Ring buffer geometry of a capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingBufferConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
}

fn default_block_size() -> usize {
    DEFAULT_RING_BUFFER_BLOCK_SIZE
}

fn default_num_blocks() -> usize {
    DEFAULT_RING_BUFFER_NUM_BLOCKS
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_RING_BUFFER_BLOCK_SIZE,
            num_blocks: DEFAULT_RING_BUFFER_NUM_BLOCKS,
        }
    }
}
