//! Flat `namespace.key` tunables (spec §6 "Environment").
//!
//! Every timeout and ring capacity named in spec §5/§6 is looked up here with
//! a documented default and bound; out-of-range values clamp rather than
//! error. Debug-trace toggles are left to `tracing`'s own target filters
//! (`RUST_LOG=btstack::hci=trace,btstack::smp=trace`, ...) rather than a
//! bespoke flag per subsystem.

use std::collections::HashMap;
use std::time::Duration;

use crate::pairing::IoCapability;

/// A tunable's raw source: normally the process environment, but
/// constructible from a plain map in tests.
#[derive(Debug, Clone, Default)]
pub struct EnvMap(HashMap<String, String>);

impl EnvMap {
    pub fn from_process_env() -> Self {
        let mut map = HashMap::new();
        for (k, v) in std::env::vars() {
            if let Some(key) = k.strip_prefix("BTSTACK_") {
                map.insert(key.to_ascii_lowercase().replace('_', "."), v);
            }
        }
        EnvMap(map)
    }

    pub fn from_pairs<I: IntoIterator<Item = (&'static str, &'static str)>>(pairs: I) -> Self {
        EnvMap(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

fn duration_ms(env: &EnvMap, key: &str, default_ms: u64, min_ms: u64, max_ms: u64) -> Duration {
    let ms = env
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms)
        .clamp(min_ms, max_ms);
    Duration::from_millis(ms)
}

fn bounded_usize(env: &EnvMap, key: &str, default: usize, min: usize, max: usize) -> usize {
    env.get(key)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Every configurable timeout and bound used by the transport, L2CAP, GATT
/// and SMP layers. All defaults mirror spec §5's table.
#[derive(Debug, Clone)]
pub struct Config {
    /// HCI/MGMT command reply timeout (default 3s).
    pub hci_reply_timeout: Duration,
    /// HCI power-on command reply timeout (default 6s).
    pub hci_power_on_timeout: Duration,
    /// Capacity of the HCI reply ring (default 64).
    pub hci_reply_ring_capacity: usize,
    /// Number of stale-reply retries on `send_with_reply` (default = ring capacity).
    pub hci_reply_retries: usize,
    /// Maximum raw HCI/MGMT frame size read per iteration.
    pub hci_max_frame_size: usize,
    /// ATT MTU-exchange timeout (default 2.5s).
    pub att_initial_timeout: Duration,
    /// ATT read timeout (default 0.5s).
    pub att_read_timeout: Duration,
    /// ATT write timeout (default 0.5s).
    pub att_write_timeout: Duration,
    /// SMP read/write timeout (default 0.5s).
    pub smp_io_timeout: Duration,
    /// SMP pairing watchdog poll interval (default 2s).
    pub smp_watchdog_interval: Duration,
    /// L2CAP poll timeout for interruptible reads (default 10s).
    pub l2cap_poll_timeout: Duration,
    /// L2CAP connect retry count on `ETIMEDOUT` (default 3).
    pub l2cap_connect_retries: usize,
    /// Reader-thread join timeout on close (default 8s).
    pub thread_shutdown_timeout: Duration,
    /// Connection gate wait timeout (default 10s).
    pub connect_gate_timeout: Duration,
    /// Maximum controller-initiated-disable scan restart retries (default 3).
    pub scan_restart_max_retries: usize,
    /// Default I/O capability advertised to peers (default NoInputNoOutput).
    pub default_io_capability: IoCapability,
    /// Whether `start_discovery` also issues a BR/EDR inquiry alongside the
    /// LE scan (default false: most deployments only care about LE).
    pub scan_bredr: bool,
}

impl Config {
    pub fn from_env(env: &EnvMap) -> Self {
        Config {
            hci_reply_timeout: duration_ms(env, "hci.reply_timeout_ms", 3_000, 100, 60_000),
            hci_power_on_timeout: duration_ms(env, "hci.power_on_timeout_ms", 6_000, 100, 60_000),
            hci_reply_ring_capacity: bounded_usize(env, "hci.reply_ring_capacity", 64, 4, 4096),
            hci_reply_retries: bounded_usize(env, "hci.reply_retries", 64, 1, 4096),
            hci_max_frame_size: bounded_usize(env, "hci.max_frame_size", 1024, 32, 65_535),
            att_initial_timeout: duration_ms(env, "att.initial_timeout_ms", 2_500, 100, 30_000),
            att_read_timeout: duration_ms(env, "att.read_timeout_ms", 500, 50, 30_000),
            att_write_timeout: duration_ms(env, "att.write_timeout_ms", 500, 50, 30_000),
            smp_io_timeout: duration_ms(env, "smp.io_timeout_ms", 500, 50, 30_000),
            smp_watchdog_interval: duration_ms(env, "smp.watchdog_interval_ms", 2_000, 100, 60_000),
            l2cap_poll_timeout: duration_ms(env, "l2cap.poll_timeout_ms", 10_000, 100, 120_000),
            l2cap_connect_retries: bounded_usize(env, "l2cap.connect_retries", 3, 0, 10),
            thread_shutdown_timeout: duration_ms(env, "thread.shutdown_timeout_ms", 8_000, 100, 60_000),
            connect_gate_timeout: duration_ms(env, "adapter.connect_gate_timeout_ms", 10_000, 100, 120_000),
            scan_restart_max_retries: bounded_usize(env, "adapter.scan_restart_max_retries", 3, 0, 20),
            default_io_capability: env
                .get("adapter.default_io_capability")
                .and_then(parse_io_capability)
                .unwrap_or(IoCapability::NoInputNoOutput),
            scan_bredr: env.get("adapter.scan_bredr").map(|v| v == "1" || v == "true").unwrap_or(false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env(&EnvMap::default())
    }
}

fn parse_io_capability(s: &str) -> Option<IoCapability> {
    Some(match s {
        "display_only" => IoCapability::DisplayOnly,
        "display_yes_no" => IoCapability::DisplayYesNo,
        "keyboard_only" => IoCapability::KeyboardOnly,
        "no_input_no_output" => IoCapability::NoInputNoOutput,
        "keyboard_display" => IoCapability::KeyboardDisplay,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.hci_reply_timeout, Duration::from_secs(3));
        assert_eq!(config.hci_power_on_timeout, Duration::from_secs(6));
        assert_eq!(config.hci_reply_ring_capacity, 64);
        assert_eq!(config.l2cap_poll_timeout, Duration::from_secs(10));
        assert_eq!(config.l2cap_connect_retries, 3);
        assert_eq!(config.thread_shutdown_timeout, Duration::from_secs(8));
        assert_eq!(config.smp_watchdog_interval, Duration::from_secs(2));
        assert_eq!(config.default_io_capability, IoCapability::NoInputNoOutput);
    }

    #[test]
    fn out_of_range_clamps_to_bound() {
        let env = EnvMap::from_pairs([("hci.reply_ring_capacity", "999999")]);
        let config = Config::from_env(&env);
        assert_eq!(config.hci_reply_ring_capacity, 4096);
    }

    #[test]
    fn scan_bredr_defaults_off_and_parses_truthy_values() {
        assert!(!Config::default().scan_bredr);
        let env = EnvMap::from_pairs([("adapter.scan_bredr", "true")]);
        assert!(Config::from_env(&env).scan_bredr);
    }
}
