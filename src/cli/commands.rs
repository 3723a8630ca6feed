//! CLI command implementations
//!
//! `simulate` builds a cluster of channels on an `InMemoryNetwork`, drives
//! it through join, multicast delivery and optionally a partition followed by
//! a merge, and prints one JSON report. `check-config` loads and validates a
//! configuration file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};

use crate::address::Address;
use crate::message::Message;
use crate::observability::{log_event_with_fields, Event, Logger, Severity};
use crate::stack::{Channel, InMemoryNetwork, Receiver, StackConfig};
use crate::sync::wait_until;
use crate::timer::{Scheduler, TokioScheduler};
use crate::view::View;

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

const POLL: Duration = Duration::from_millis(20);

/// Parameters of one `simulate` run.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub members: usize,
    pub messages: usize,
    pub partition: bool,
    pub cluster: String,
    pub config: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            members: 3,
            messages: 10,
            partition: false,
            cluster: "aerocast-sim".to_string(),
            config: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Parse the command line, run the command, print its result.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    Logger::set_min_severity(if cli.verbose {
        Severity::Info
    } else {
        Severity::Warn
    });
    let result = run_command(cli.command);
    if let Err(e) = &result {
        write_error(e.code_str(), e.message())?;
    }
    result
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let report = match cmd {
        Command::Simulate {
            members,
            messages,
            partition,
            cluster,
            config,
            timeout_secs,
        } => simulate(&SimulationOptions {
            members,
            messages,
            partition,
            cluster,
            config,
            timeout: Duration::from_secs(timeout_secs),
        })?,
        Command::CheckConfig { config } => check_config(&config)?,
    };
    write_response(report)
}

/// Load and validate `path`; report the effective configuration.
pub fn check_config(path: &Path) -> CliResult<Value> {
    let config = StackConfig::load(path)?;
    let path_str = path.display().to_string();
    log_event_with_fields(Event::ConfigLoaded, &[("path", &path_str)]);
    Ok(json!({
        "path": path_str,
        "valid": true,
        "config": serde_json::to_value(&config)?,
    }))
}

/// Configuration used when `simulate` is given no file: defaults, with merge
/// detection fast enough for an interactive run.
fn simulation_config() -> StackConfig {
    let mut config = StackConfig::default();
    config.gms.join_timeout_ms = 500;
    config.gms.merge_min_interval_ms = 500;
    config.gms.merge_max_interval_ms = 1500;
    config.gms.merge_timeout_ms = 1000;
    config
}

/// Counts deliveries.
#[derive(Default)]
struct Counter {
    delivered: AtomicU64,
}

impl Receiver for Counter {
    fn receive(&self, _msg: Message) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

struct Node {
    channel: Channel,
    counter: Arc<Counter>,
}

impl Node {
    fn delivered(&self) -> u64 {
        self.counter.delivered.load(Ordering::Relaxed)
    }

    fn view_size(&self) -> usize {
        self.channel.get_view().map(|v| v.size()).unwrap_or(0)
    }
}

/// Run a cluster on an in-memory network and report on it.
pub fn simulate(opts: &SimulationOptions) -> CliResult<Value> {
    if opts.members == 0 {
        return Err(CliError::config_error("members must be >= 1"));
    }
    let config = match &opts.config {
        Some(path) => StackConfig::load(path)?,
        None => simulation_config(),
    };
    if opts.partition {
        if opts.members < 2 {
            return Err(CliError::config_error("a partition needs at least 2 members"));
        }
        if !config.gms.merge_enabled() {
            return Err(CliError::config_error(
                "a partition run needs merge detection (merge_max_interval_ms > 0)",
            ));
        }
    }

    let started = Instant::now();
    let net = InMemoryNetwork::new();
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(config.timer_threads)?);

    let mut nodes = Vec::with_capacity(opts.members);
    for i in 0..opts.members {
        let local = Address::from_u128(i as u128 + 1);
        let channel = Channel::new(
            config.clone(),
            net.endpoint(local),
            net.discovery(),
            Arc::clone(&scheduler),
        )?;
        let counter = Arc::new(Counter::default());
        channel.set_receiver(Some(counter.clone()));
        channel.connect(&opts.cluster)?;
        nodes.push(Node { channel, counter });
    }

    let n = opts.members;
    converge(opts.timeout, "initial view", || {
        nodes.iter().all(|node| node.view_size() == n)
    })?;

    for (i, node) in nodes.iter().enumerate() {
        for seq in 0..opts.messages {
            let payload = Bytes::from(format!("{}:{}", i, seq));
            node.channel.send(Message::new(None, payload))?;
        }
    }
    let expected = (n * opts.messages) as u64;
    converge(opts.timeout, "multicast delivery", || {
        nodes.iter().all(|node| node.delivered() >= expected)
    })?;

    let mut merged = false;
    if opts.partition {
        let addrs: Vec<Address> = nodes
            .iter()
            .map(|node| node.channel.local_address().clone())
            .collect();
        let (left, right) = addrs.split_at(n / 2);
        net.partition(&[left.to_vec(), right.to_vec()]);
        converge(opts.timeout, "partitioned views", || {
            nodes.iter().enumerate().all(|(i, node)| {
                let side = if i < n / 2 { left.len() } else { right.len() };
                node.view_size() == side
            })
        })?;

        net.heal();
        converge(opts.timeout, "merged view", || {
            let views: Vec<Option<View>> = nodes.iter().map(|node| node.channel.get_view()).collect();
            views.iter().all(|v| v.as_ref().map(|v| v.size()) == Some(n))
                && views.windows(2).all(|w| w[0] == w[1])
        })?;
        merged = true;
    }

    let report: Vec<Value> = nodes
        .iter()
        .map(|node| {
            json!({
                "address": node.channel.local_address().to_string(),
                "view": node.channel.get_view().map(|v| v.to_string()),
                "delivered": node.delivered(),
                "metrics": serde_json::to_value(node.channel.metrics().snapshot())
                    .unwrap_or(Value::Null),
            })
        })
        .collect();

    for node in &nodes {
        node.channel.close();
    }

    Ok(json!({
        "cluster": opts.cluster,
        "members": n,
        "messages_per_member": opts.messages,
        "partitioned": opts.partition,
        "merged": merged,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "nodes": report,
    }))
}

fn converge(timeout: Duration, step: &str, pred: impl FnMut() -> bool) -> CliResult<()> {
    if wait_until(timeout, POLL, pred) {
        Ok(())
    } else {
        Err(CliError::timeout(format!(
            "{} not reached within {:?}",
            step, timeout
        )))
    }
}
