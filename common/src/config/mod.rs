//! Pipeline configuration, loaded from a YAML file and merged with CLI
//! flags by the binary.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::err::{KResult, KashoError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KashoConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// `postgresql` or `mysql`; capture and apply share one flavor.
    pub dialect: String,

    /// Primary database, URL form.
    pub primary_url: String,

    /// Replica database, URL form.
    pub replica_url: String,

    /// Buffer store (Redis), single URL.
    pub buffer_url: String,

    /// Replication slot name (Postgres) / replication client id (MySQL).
    #[serde(default = "default_slot")]
    pub slot_name: String,

    /// Path to the transform ruleset; absent means pass-through.
    #[serde(default)]
    pub transform_rules: Option<String>,

    /// Downgrade transform-layer failures from fatal to
    /// skip-with-warning. Apply failures stay fatal regardless.
    #[serde(default)]
    pub transform_skip_errors: bool,

    /// Batch size for buffer range scans.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Applier checkpoint flush cadence, seconds.
    #[serde(default = "default_flush_secs")]
    pub checkpoint_flush_secs: u64,

    /// Change-stream RPC bind address.
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: String,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub base: BaseConfig,

    /// Unique server id this service presents to a MySQL primary.
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Per-table row cap for test dumps; absent means unbounded.
    #[serde(default)]
    pub bootstrap_row_cap: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Key namespace; the sorted set lives at `<namespace>:changes`.
    pub namespace: String,

    /// Sorted-set retention, refreshed on every add.
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts before a transient failure turns fatal.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Log output directory; stdout only when unset.
    pub log_dir: Option<String>,

    #[serde(default)]
    pub debug: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            namespace: "kasho".to_string(),
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            max_retries: 10,
        }
    }
}

fn default_app_name() -> String {
    "kasho".to_string()
}

fn default_slot() -> String {
    "kasho".to_string()
}

fn default_batch_size() -> usize {
    256
}

fn default_flush_secs() -> u64 {
    5
}

fn default_rpc_bind() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_server_id() -> u32 {
    u32::MAX - 117
}

pub fn read_config<P: AsRef<Path>>(path: P) -> KResult<KashoConfig> {
    let mut buf = String::new();
    File::open(path.as_ref())
        .map_err(|e| KashoError::Config(format!("{}: {}", path.as_ref().display(), e)))?
        .read_to_string(&mut buf)
        .map_err(|e| KashoError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
    parse_config(&buf)
}

pub fn parse_config(yaml: &str) -> KResult<KashoConfig> {
    serde_yaml::from_str(yaml).map_err(|e| KashoError::Config(e.to_string()))
}
