//! Node configuration.
//!
//! A [`Config`] is built once at startup (from CLI flags in the binary, or with
//! struct-update syntax in tests) and threaded through every constructor. Nothing in
//! the crate reads configuration from globals.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration shared by a volume, its directories and the sync layer.
#[derive(Clone, Debug)]
pub struct Config {
    /// Volume root directory.
    pub data_root: PathBuf,

    /// Identifier of this node, used as packet sender and online-sync peer id.
    pub node_id: String,

    /// Capacity of each resource's index write queue.
    pub write_queue_size: usize,

    /// Number of processed writes that triggers an index commit.
    pub flush_threshold: usize,

    /// Commit pending writes after this much idle time. Zero disables the timer.
    pub flush_timeout: Duration,

    /// Language preference used for localized projection and sorting.
    pub languages: Vec<String>,

    /// Language assigned to plain strings when migrating localized properties.
    pub default_language: String,

    /// Page size used when enumerating documents for a diff.
    pub diff_page_size: usize,

    /// Hard size limit of a sneakernet packet, in bytes.
    pub packet_limit: u64,

    /// Bytes reserved inside `packet_limit` for trailing records.
    pub packet_reserve: u64,

    /// Chunk size used when streaming BLOBs.
    pub blob_chunk_size: usize,

    /// Lower bound of the online-sync reconnect backoff.
    pub sync_backoff_min: Duration,

    /// Upper bound of the online-sync reconnect backoff.
    pub sync_backoff_max: Duration,

    /// Period of the online "sync" command that carries acks.
    pub sync_interval: Duration,

    /// Timeout for a single online-sync network read or write.
    pub sync_timeout: Duration,

    /// Capacity of each event subscriber's channel.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("sndb-data"),
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            write_queue_size: 256,
            flush_threshold: 32,
            flush_timeout: Duration::from_secs(5),
            languages: vec!["en".to_string()],
            default_language: "en".to_string(),
            diff_page_size: 256,
            packet_limit: 100 * 1024 * 1024,
            packet_reserve: 1024 * 1024,
            blob_chunk_size: 64 * 1024,
            sync_backoff_min: Duration::from_secs(3),
            sync_backoff_max: Duration::from_secs(15 * 60),
            sync_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(30),
            event_buffer: 1024,
        }
    }
}

impl Config {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Default::default()
        }
    }

    pub fn with_flush(mut self, threshold: usize, timeout: Duration) -> Self {
        self.flush_threshold = threshold;
        self.flush_timeout = timeout;
        self
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Usable packet budget: the hard limit minus the reservation.
    pub fn packet_budget(&self) -> u64 {
        self.packet_limit.saturating_sub(self.packet_reserve)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_queue_size == 0 {
            return Err(Error::InvalidValue(
                "write_queue_size must be greater than 0".to_string(),
            ));
        }

        if self.flush_threshold == 0 {
            return Err(Error::InvalidValue(
                "flush_threshold must be greater than 0".to_string(),
            ));
        }

        if self.diff_page_size == 0 {
            return Err(Error::InvalidValue(
                "diff_page_size must be greater than 0".to_string(),
            ));
        }

        if self.packet_reserve >= self.packet_limit {
            return Err(Error::InvalidValue(
                "packet_reserve must be less than packet_limit".to_string(),
            ));
        }

        if self.blob_chunk_size == 0 {
            return Err(Error::InvalidValue(
                "blob_chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.sync_backoff_min > self.sync_backoff_max {
            return Err(Error::InvalidValue(
                "sync_backoff_min must not exceed sync_backoff_max".to_string(),
            ));
        }

        if self.node_id.is_empty() {
            return Err(Error::InvalidValue("node_id cannot be empty".to_string()));
        }

        Ok(())
    }
}
