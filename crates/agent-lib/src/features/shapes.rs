//! Log shapes recognized by the feature extractor
//!
//! A shape is selected by the presence of its marker fields on an entry,
//! never by a type tag, so new shapes can be registered on the extractor
//! without touching the existing ones.

use crate::models::{FeatureVector, LogEntry};
use std::collections::BTreeSet;

/// Feature names produced by the built-in shapes
pub mod names {
    pub const AUTH_FAILURES: &str = "auth_failures";
    pub const AUTH_FAILURE_RATE: &str = "auth_failure_rate";
    pub const DEAUTH_FRAMES: &str = "deauth_frames";
    pub const BEACON_FRAMES: &str = "beacon_frames";
    pub const DISTINCT_CLIENT_MACS: &str = "distinct_client_macs";

    pub const DNS_QUERIES: &str = "dns_queries";
    pub const DNS_QUERY_RATE: &str = "dns_query_rate";
    pub const DISTINCT_DOMAINS: &str = "distinct_domains";
    pub const NXDOMAIN_RESPONSES: &str = "nxdomain_responses";

    pub const BLOCKED_CONNECTIONS: &str = "blocked_connections";
    pub const BLOCKED_RATE: &str = "blocked_rate";
    pub const DISTINCT_DST_PORTS: &str = "distinct_dst_ports";
    pub const DISTINCT_SRC_IPS: &str = "distinct_src_ips";

    pub const ENTRY_COUNT: &str = "entry_count";
    pub const ERROR_COUNT: &str = "error_count";
    pub const DISTINCT_PROCESSES: &str = "distinct_processes";
}

/// A family of log entries that share shape-specific fields
pub trait LogShape: Send + Sync {
    /// Short name, used by `featureExtraction.disabledShapes`
    fn name(&self) -> &'static str;

    /// Whether `entry` carries this shape's fields
    fn matches(&self, entry: &LogEntry) -> bool;

    /// Fresh per-entity accumulator
    fn accumulator(&self) -> Box<dyn ShapeAccumulator>;
}

/// Per-entity running state for one shape
pub trait ShapeAccumulator: Send {
    fn observe(&mut self, entry: &LogEntry);

    /// Write the shape's features; `minutes` is the window length (>= 1)
    fn finish(&self, minutes: f64, out: &mut FeatureVector);
}

fn has_any(entry: &LogEntry, markers: &[&str]) -> bool {
    markers.iter().any(|m| entry.has_field(m))
}

// ── WiFi ───────────────────────────────────────────────────────────

const WIFI_MARKERS: &[&str] = &["authFailures", "deauthFrames", "beaconFrames", "clientMac"];

/// WiFi authentication / management-frame events
pub struct WifiShape;

impl LogShape for WifiShape {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        has_any(entry, WIFI_MARKERS)
    }

    fn accumulator(&self) -> Box<dyn ShapeAccumulator> {
        Box::<WifiAccumulator>::default()
    }
}

#[derive(Default)]
struct WifiAccumulator {
    auth_failures: f64,
    deauth_frames: f64,
    beacon_frames: f64,
    client_macs: BTreeSet<String>,
}

impl ShapeAccumulator for WifiAccumulator {
    fn observe(&mut self, entry: &LogEntry) {
        self.auth_failures += entry.number("authFailures").unwrap_or(0.0).max(0.0);
        self.deauth_frames += entry.number("deauthFrames").unwrap_or(0.0).max(0.0);
        self.beacon_frames += entry.number("beaconFrames").unwrap_or(0.0).max(0.0);
        if let Some(mac) = entry.text("clientMac") {
            self.client_macs.insert(mac.trim().to_ascii_lowercase());
        }
    }

    fn finish(&self, minutes: f64, out: &mut FeatureVector) {
        out.set(names::AUTH_FAILURES, self.auth_failures);
        out.set(names::AUTH_FAILURE_RATE, self.auth_failures / minutes);
        out.set(names::DEAUTH_FRAMES, self.deauth_frames);
        out.set(names::BEACON_FRAMES, self.beacon_frames);
        out.set(names::DISTINCT_CLIENT_MACS, self.client_macs.len() as f64);
    }
}

// ── DNS ────────────────────────────────────────────────────────────

const DNS_MARKERS: &[&str] = &["dnsQuery", "queryName", "rcode"];

/// DNS NXDOMAIN response code
const RCODE_NXDOMAIN: f64 = 3.0;

/// DNS query / response events
pub struct DnsShape;

impl LogShape for DnsShape {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        has_any(entry, DNS_MARKERS)
    }

    fn accumulator(&self) -> Box<dyn ShapeAccumulator> {
        Box::<DnsAccumulator>::default()
    }
}

#[derive(Default)]
struct DnsAccumulator {
    queries: f64,
    nxdomain: f64,
    domains: BTreeSet<String>,
}

impl ShapeAccumulator for DnsAccumulator {
    fn observe(&mut self, entry: &LogEntry) {
        self.queries += 1.0;

        if let Some(domain) = entry.text("dnsQuery").or_else(|| entry.text("queryName")) {
            let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if !domain.is_empty() {
                self.domains.insert(domain);
            }
        }

        let is_nxdomain = match entry.text("rcode") {
            Some(code) => code.eq_ignore_ascii_case("NXDOMAIN"),
            None => entry.number("rcode") == Some(RCODE_NXDOMAIN),
        };
        if is_nxdomain {
            self.nxdomain += 1.0;
        }
    }

    fn finish(&self, minutes: f64, out: &mut FeatureVector) {
        out.set(names::DNS_QUERIES, self.queries);
        out.set(names::DNS_QUERY_RATE, self.queries / minutes);
        out.set(names::DISTINCT_DOMAINS, self.domains.len() as f64);
        out.set(names::NXDOMAIN_RESPONSES, self.nxdomain);
    }
}

// ── Firewall ───────────────────────────────────────────────────────

const FIREWALL_MARKERS: &[&str] = &["firewallAction", "dstPort"];

const BLOCK_ACTIONS: &[&str] = &["block", "blocked", "deny", "denied", "drop", "reject"];

/// Firewall connection verdicts
pub struct FirewallShape;

impl LogShape for FirewallShape {
    fn name(&self) -> &'static str {
        "firewall"
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        has_any(entry, FIREWALL_MARKERS)
    }

    fn accumulator(&self) -> Box<dyn ShapeAccumulator> {
        Box::<FirewallAccumulator>::default()
    }
}

#[derive(Default)]
struct FirewallAccumulator {
    blocked: f64,
    dst_ports: BTreeSet<u64>,
    src_ips: BTreeSet<String>,
}

impl ShapeAccumulator for FirewallAccumulator {
    fn observe(&mut self, entry: &LogEntry) {
        if let Some(action) = entry.text("firewallAction") {
            let action = action.trim();
            if BLOCK_ACTIONS.iter().any(|a| action.eq_ignore_ascii_case(a)) {
                self.blocked += 1.0;
            }
        }
        if let Some(port) = entry.number("dstPort") {
            if port >= 0.0 {
                self.dst_ports.insert(port as u64);
            }
        }
        if let Some(ip) = entry.text("srcIp") {
            self.src_ips.insert(ip.trim().to_string());
        }
    }

    fn finish(&self, minutes: f64, out: &mut FeatureVector) {
        out.set(names::BLOCKED_CONNECTIONS, self.blocked);
        out.set(names::BLOCKED_RATE, self.blocked / minutes);
        out.set(names::DISTINCT_DST_PORTS, self.dst_ports.len() as f64);
        out.set(names::DISTINCT_SRC_IPS, self.src_ips.len() as f64);
    }
}

// ── Generic ────────────────────────────────────────────────────────

/// Fallback feature set computed for every entity
pub(crate) struct GenericAccumulator<'a> {
    error_levels: &'a BTreeSet<String>,
    entries: f64,
    errors: f64,
    processes: BTreeSet<String>,
}

impl<'a> GenericAccumulator<'a> {
    pub(crate) fn new(error_levels: &'a BTreeSet<String>) -> Self {
        Self {
            error_levels,
            entries: 0.0,
            errors: 0.0,
            processes: BTreeSet::new(),
        }
    }

    pub(crate) fn observe(&mut self, entry: &LogEntry) {
        self.entries += 1.0;
        if let Some(level) = entry.level.as_deref() {
            if self.error_levels.contains(&level.trim().to_ascii_lowercase()) {
                self.errors += 1.0;
            }
        }
        if let Some(process) = entry.process.as_deref() {
            self.processes.insert(process.to_string());
        }
    }

    pub(crate) fn finish(&self, out: &mut FeatureVector) {
        out.set(names::ENTRY_COUNT, self.entries);
        out.set(names::ERROR_COUNT, self.errors);
        out.set(names::DISTINCT_PROCESSES, self.processes.len() as f64);
    }
}
