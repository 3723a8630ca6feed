//! Stack configuration
//!
//! One JSON document, one section per protocol. Every field has a default,
//! so `{}` is a valid configuration. `load` parses and validates; invalid
//! values fail fast with `StackError::Config`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{StackError, StackResult};
use crate::address::Address;
use crate::message::MAX_FRAGMENTS;
use crate::window::Interval;

/// Retransmission interval strategy as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntervalConfig {
    Static { values_ms: Vec<u64> },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl IntervalConfig {
    pub fn build(&self) -> StackResult<Interval> {
        let interval = match self {
            IntervalConfig::Static { values_ms } => {
                Interval::static_list(values_ms.iter().map(|v| Duration::from_millis(*v)).collect())?
            }
            IntervalConfig::Exponential { initial_ms, max_ms } => Interval::exponential(
                Duration::from_millis(*initial_ms),
                Duration::from_millis(*max_ms),
            )?,
        };
        Ok(interval)
    }
}

/// Outbound batching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundlerKind {
    /// One queue per destination, flushed by size or by the sending thread
    PerDestination,
    /// Shared ring buffer drained by a single consumer
    RingBuffer,
}

/// Membership change policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Append joiners, remove leavers, keep relative order
    Default,
    /// Make the newest member coordinator when the coordinator leaves
    PromoteNewest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_bundler")]
    pub bundler: BundlerKind,

    /// Flush a bundle once its encoded size reaches this many bytes
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,

    /// Ring buffer slots (power of two)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NakackConfig {
    #[serde(default = "default_table_rows")]
    pub table_rows: usize,

    #[serde(default = "default_table_row_len")]
    pub table_row_len: usize,

    #[serde(default = "default_resize_factor")]
    pub resize_factor: f64,

    #[serde(default = "default_xmit_interval")]
    pub xmit_interval: IntervalConfig,

    /// Period of stability gossip; 0 disables it
    #[serde(default = "default_stable_interval_ms")]
    pub stable_interval_ms: u64,

    /// Messages removed from a window per delivery pass
    #[serde(default = "default_max_batch")]
    pub max_delivery_batch: usize,

    #[serde(default = "default_digest_history")]
    pub digest_history_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnicastConfig {
    #[serde(default = "default_xmit_interval")]
    pub xmit_interval: IntervalConfig,

    /// Idle connections are closed after this long; 0 disables expiry
    #[serde(default = "default_conn_expiry_ms")]
    pub conn_expiry_ms: u64,

    /// Period of the tail-loss sweep; 0 disables it
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,

    #[serde(default = "default_table_rows")]
    pub table_rows: usize,

    #[serde(default = "default_table_row_len")]
    pub table_row_len: usize,

    #[serde(default = "default_resize_factor")]
    pub resize_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmsConfig {
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_max_join_attempts")]
    pub max_join_attempts: u32,

    #[serde(default = "default_view_ack_timeout_ms")]
    pub view_ack_collection_timeout_ms: u64,

    #[serde(default = "default_leave_timeout_ms")]
    pub leave_timeout_ms: u64,

    /// Merge detection runs at a random interval in [min, max]; 0 disables it
    #[serde(default = "default_merge_min_ms")]
    pub merge_min_interval_ms: u64,

    #[serde(default = "default_merge_max_ms")]
    pub merge_max_interval_ms: u64,

    /// Time to collect merge responses
    #[serde(default = "default_merge_timeout_ms")]
    pub merge_timeout_ms: u64,

    /// Time allowed for the post-merge rebroadcast
    #[serde(default = "default_rebroadcast_timeout_ms")]
    pub rebroadcast_timeout_ms: u64,

    #[serde(default = "default_policy")]
    pub policy: PolicyKind,

    /// Wins coordinator arbitration during merges when present
    #[serde(default)]
    pub preferred_coordinator: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_max_credits")]
    pub max_credits: u64,

    /// Fraction of `max_credits` consumed before the receiver replenishes
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f64,

    /// Longest a sender blocks for credits; 0 means send anyway immediately
    #[serde(default = "default_max_block_time_ms")]
    pub max_block_time_ms: u64,

    /// Queue instead of blocking when credits run out
    #[serde(default)]
    pub non_blocking: bool,

    /// Bytes a non-blocking sender may queue per destination
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragConfig {
    /// Payloads above this many bytes are fragmented
    #[serde(default = "default_frag_size")]
    pub frag_size: usize,

    /// Incomplete fragment sets older than this are discarded
    #[serde(default = "default_reassembly_timeout_ms")]
    pub reassembly_timeout_ms: u64,

    /// Most fragments one message may be split into, sending or receiving
    #[serde(default = "default_max_fragments")]
    pub max_fragments: u32,
}

/// Complete protocol stack configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Worker threads of the default scheduler
    #[serde(default = "default_timer_threads")]
    pub timer_threads: usize,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub nakack: NakackConfig,

    #[serde(default)]
    pub unicast: UnicastConfig,

    #[serde(default)]
    pub gms: GmsConfig,

    #[serde(default)]
    pub multicast_flow: FlowConfig,

    #[serde(default)]
    pub unicast_flow: FlowConfig,

    #[serde(default)]
    pub frag: FragConfig,
}

fn default_bundler() -> BundlerKind {
    BundlerKind::PerDestination
}
fn default_max_bundle_size() -> usize {
    64_000
}
fn default_ring_capacity() -> usize {
    1024
}
fn default_table_rows() -> usize {
    10
}
fn default_table_row_len() -> usize {
    256
}
fn default_resize_factor() -> f64 {
    1.2
}
fn default_xmit_interval() -> IntervalConfig {
    IntervalConfig::Exponential {
        initial_ms: 50,
        max_ms: 1600,
    }
}
fn default_stable_interval_ms() -> u64 {
    1000
}
fn default_max_batch() -> usize {
    100
}
fn default_digest_history() -> usize {
    10
}
fn default_conn_expiry_ms() -> u64 {
    120_000
}
fn default_resend_interval_ms() -> u64 {
    500
}
fn default_join_timeout_ms() -> u64 {
    2000
}
fn default_max_join_attempts() -> u32 {
    3
}
fn default_view_ack_timeout_ms() -> u64 {
    2000
}
fn default_leave_timeout_ms() -> u64 {
    2000
}
fn default_merge_min_ms() -> u64 {
    5000
}
fn default_merge_max_ms() -> u64 {
    15_000
}
fn default_merge_timeout_ms() -> u64 {
    3000
}
fn default_rebroadcast_timeout_ms() -> u64 {
    2000
}
fn default_policy() -> PolicyKind {
    PolicyKind::Default
}
fn default_max_credits() -> u64 {
    2_000_000
}
fn default_min_threshold() -> f64 {
    0.4
}
fn default_max_block_time_ms() -> u64 {
    5000
}
fn default_max_queue_size() -> u64 {
    10_000_000
}
fn default_frag_size() -> usize {
    60_000
}
fn default_reassembly_timeout_ms() -> u64 {
    30_000
}
fn default_max_fragments() -> u32 {
    MAX_FRAGMENTS
}
fn default_timer_threads() -> usize {
    4
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bundler: default_bundler(),
            max_bundle_size: default_max_bundle_size(),
            ring_capacity: default_ring_capacity(),
        }
    }
}

impl Default for NakackConfig {
    fn default() -> Self {
        Self {
            table_rows: default_table_rows(),
            table_row_len: default_table_row_len(),
            resize_factor: default_resize_factor(),
            xmit_interval: default_xmit_interval(),
            stable_interval_ms: default_stable_interval_ms(),
            max_delivery_batch: default_max_batch(),
            digest_history_size: default_digest_history(),
        }
    }
}

impl Default for UnicastConfig {
    fn default() -> Self {
        Self {
            xmit_interval: default_xmit_interval(),
            conn_expiry_ms: default_conn_expiry_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            table_rows: default_table_rows(),
            table_row_len: default_table_row_len(),
            resize_factor: default_resize_factor(),
        }
    }
}

impl Default for GmsConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: default_join_timeout_ms(),
            max_join_attempts: default_max_join_attempts(),
            view_ack_collection_timeout_ms: default_view_ack_timeout_ms(),
            leave_timeout_ms: default_leave_timeout_ms(),
            merge_min_interval_ms: default_merge_min_ms(),
            merge_max_interval_ms: default_merge_max_ms(),
            merge_timeout_ms: default_merge_timeout_ms(),
            rebroadcast_timeout_ms: default_rebroadcast_timeout_ms(),
            policy: default_policy(),
            preferred_coordinator: None,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_credits: default_max_credits(),
            min_threshold: default_min_threshold(),
            max_block_time_ms: default_max_block_time_ms(),
            non_blocking: false,
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl Default for FragConfig {
    fn default() -> Self {
        Self {
            frag_size: default_frag_size(),
            reassembly_timeout_ms: default_reassembly_timeout_ms(),
            max_fragments: default_max_fragments(),
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timer_threads: default_timer_threads(),
            transport: TransportConfig::default(),
            nakack: NakackConfig::default(),
            unicast: UnicastConfig::default(),
            gms: GmsConfig::default(),
            multicast_flow: FlowConfig::default(),
            unicast_flow: FlowConfig::default(),
            frag: FragConfig::default(),
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl StackConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load(path: &Path) -> StackResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| StackError::config(format!("Failed to read config: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate a JSON document
    pub fn from_json(content: &str) -> StackResult<Self> {
        let config: StackConfig = serde_json::from_str(content)
            .map_err(|e| StackError::config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that would otherwise fail later at construction
    pub fn validate(&self) -> StackResult<()> {
        if self.timer_threads == 0 {
            return Err(StackError::config("timer_threads must be > 0"));
        }

        let t = &self.transport;
        if t.max_bundle_size == 0 {
            return Err(StackError::config("transport.max_bundle_size must be > 0"));
        }
        if t.ring_capacity == 0 || !t.ring_capacity.is_power_of_two() {
            return Err(StackError::config(format!(
                "transport.ring_capacity must be a power of two, got {}",
                t.ring_capacity
            )));
        }

        let n = &self.nakack;
        check_table("nakack", n.table_rows, n.table_row_len, n.resize_factor)?;
        n.xmit_interval
            .build()
            .map_err(|e| StackError::config(format!("nakack.xmit_interval: {}", e)))?;
        if n.max_delivery_batch == 0 {
            return Err(StackError::config("nakack.max_delivery_batch must be > 0"));
        }
        if n.digest_history_size == 0 {
            return Err(StackError::config("nakack.digest_history_size must be > 0"));
        }

        let u = &self.unicast;
        check_table("unicast", u.table_rows, u.table_row_len, u.resize_factor)?;
        u.xmit_interval
            .build()
            .map_err(|e| StackError::config(format!("unicast.xmit_interval: {}", e)))?;

        let g = &self.gms;
        if g.max_join_attempts == 0 {
            return Err(StackError::config("gms.max_join_attempts must be >= 1"));
        }
        if g.join_timeout_ms == 0 {
            return Err(StackError::config("gms.join_timeout_ms must be > 0"));
        }
        if g.merge_min_interval_ms > g.merge_max_interval_ms {
            return Err(StackError::config(format!(
                "gms.merge_min_interval_ms ({}) must be <= merge_max_interval_ms ({})",
                g.merge_min_interval_ms, g.merge_max_interval_ms
            )));
        }

        check_flow("multicast_flow", &self.multicast_flow)?;
        check_flow("unicast_flow", &self.unicast_flow)?;

        if self.frag.frag_size == 0 {
            return Err(StackError::config("frag.frag_size must be > 0"));
        }
        if self.frag.max_fragments == 0 || self.frag.max_fragments > MAX_FRAGMENTS {
            return Err(StackError::config(format!(
                "frag.max_fragments must be in [1, {}], got {}",
                MAX_FRAGMENTS, self.frag.max_fragments
            )));
        }

        Ok(())
    }
}

fn check_table(section: &str, rows: usize, row_len: usize, resize: f64) -> StackResult<()> {
    if rows == 0 || row_len == 0 {
        return Err(StackError::config(format!(
            "{}: table dimensions must be positive (rows={}, row_len={})",
            section, rows, row_len
        )));
    }
    if !(resize > 1.0) {
        return Err(StackError::config(format!(
            "{}.resize_factor must be > 1.0, got {}",
            section, resize
        )));
    }
    Ok(())
}

fn check_flow(section: &str, f: &FlowConfig) -> StackResult<()> {
    if f.max_credits == 0 {
        return Err(StackError::config(format!("{}.max_credits must be > 0", section)));
    }
    if !(f.min_threshold > 0.0 && f.min_threshold <= 1.0) {
        return Err(StackError::config(format!(
            "{}.min_threshold must be in (0, 1], got {}",
            section, f.min_threshold
        )));
    }
    Ok(())
}

impl NakackConfig {
    pub fn stable_interval(&self) -> Duration {
        ms(self.stable_interval_ms)
    }
}

impl UnicastConfig {
    pub fn conn_expiry(&self) -> Duration {
        ms(self.conn_expiry_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        ms(self.resend_interval_ms)
    }
}

impl GmsConfig {
    pub fn join_timeout(&self) -> Duration {
        ms(self.join_timeout_ms)
    }

    pub fn view_ack_collection_timeout(&self) -> Duration {
        ms(self.view_ack_collection_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        ms(self.leave_timeout_ms)
    }

    pub fn merge_timeout(&self) -> Duration {
        ms(self.merge_timeout_ms)
    }

    pub fn rebroadcast_timeout(&self) -> Duration {
        ms(self.rebroadcast_timeout_ms)
    }

    /// Whether periodic merge detection runs.
    pub fn merge_enabled(&self) -> bool {
        self.merge_max_interval_ms > 0
    }
}

impl FlowConfig {
    pub fn max_block_time(&self) -> Duration {
        ms(self.max_block_time_ms)
    }

    /// Credits a receiver accumulates before sending a replenishment.
    pub fn replenish_threshold(&self) -> u64 {
        ((self.max_credits as f64) * self.min_threshold) as u64
    }
}

impl FragConfig {
    pub fn reassembly_timeout(&self) -> Duration {
        ms(self.reassembly_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StackConfig::from_json("{}").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.gms.max_join_attempts, 3);
        assert_eq!(config.transport.bundler, BundlerKind::PerDestination);
        assert_eq!(config.multicast_flow.replenish_threshold(), 800_000);
    }

    #[test]
    fn test_nested_overrides() {
        let json = r#"{
            "nakack": {"xmit_interval": {"type": "static", "values_ms": [10, 20]}},
            "gms": {"policy": "promote_newest", "merge_min_interval_ms": 100, "merge_max_interval_ms": 200},
            "transport": {"bundler": "ring_buffer", "ring_capacity": 64}
        }"#;
        let config = StackConfig::from_json(json).unwrap();
        assert_eq!(config.gms.policy, PolicyKind::PromoteNewest);
        assert_eq!(config.transport.bundler, BundlerKind::RingBuffer);
        let mut interval = config.nakack.xmit_interval.build().unwrap();
        assert_eq!(interval.next(), Duration::from_millis(10));
        assert_eq!(interval.next(), Duration::from_millis(20));
        assert_eq!(interval.next(), Duration::from_millis(20));
        assert_eq!(config.nakack.table_rows, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            r#"{"transport": {"ring_capacity": 100}}"#,
            r#"{"nakack": {"table_rows": 0}}"#,
            r#"{"unicast": {"resize_factor": 1.0}}"#,
            r#"{"nakack": {"xmit_interval": {"type": "static", "values_ms": []}}}"#,
            r#"{"unicast": {"xmit_interval": {"type": "exponential", "initial_ms": 500, "max_ms": 100}}}"#,
            r#"{"gms": {"max_join_attempts": 0}}"#,
            r#"{"gms": {"merge_min_interval_ms": 10, "merge_max_interval_ms": 5}}"#,
            r#"{"multicast_flow": {"min_threshold": 1.5}}"#,
            r#"{"frag": {"frag_size": 0}}"#,
            r#"{"frag": {"max_fragments": 0}}"#,
            r#"{"frag": {"max_fragments": 70000}}"#,
        ];
        for json in cases {
            let err = StackConfig::from_json(json).unwrap_err();
            assert!(matches!(err, StackError::Config(_)), "{}", json);
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"frag": {{"frag_size": 1000}}}}"#).unwrap();
        let config = StackConfig::load(file.path()).unwrap();
        assert_eq!(config.frag.frag_size, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = StackConfig::load(Path::new("/nonexistent/aerocast.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_malformed_json() {
        let err = StackConfig::from_json("{not json").unwrap_err();
        assert!(err.to_string().contains("Invalid config JSON"));
    }
}
