//! Cumulative accounting and cacheable-prefix tracking for the keepalive
//! daemon. Persisted to a temp-dir JSON file on a debounce, restored and
//! merged (additively) on daemon restart.

use crate::pricing;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;

const RING_CAPACITY: usize = 20;

/// The captured cacheable prefix from the most recent request.
#[derive(Debug, Clone)]
pub struct CapturedPrefix {
    pub model: String,
    pub system: Option<String>,
    pub tools: Option<Value>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub api_beta: Option<String>,
    pub hash: String,
}

/// `MD5(JSON({model, system, tools})).hex[:12]` - stable across
/// whitespace-only JSON differences since it hashes the re-serialized value.
pub fn hash_prefix(model: &str, system: Option<&str>, tools: Option<&Value>) -> String {
    let payload = serde_json::json!({
        "model": model,
        "system": system,
        "tools": tools,
    });
    let digest = md5::compute(payload.to_string().as_bytes());
    format!("{:x}", digest)[..12].to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixChange {
    pub timestamp: i64,
    pub from_hash: Option<String>,
    pub to_hash: String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStats {
    pub reqs: u64,
    pub pings: u64,
    pub ok: u64,
    pub errs: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub reqs: u64,
    pub pings: u64,
    pub ok: u64,
    pub errs: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub input: u64,
    pub output: u64,
    pub prefix_changes: u64,
    pub per_model: HashMap<String, ModelStats>,
    pub recent_changes: VecDeque<PrefixChange>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageDelta {
    pub cache_read: u64,
    pub cache_write: u64,
    pub input: u64,
    pub output: u64,
}

impl Stats {
    pub fn record_request(&mut self, model: &str, usage: &UsageDelta) {
        self.reqs += 1;
        self.apply_usage(model, usage);
    }

    pub fn record_ping(&mut self, model: &str, success: bool, usage: &UsageDelta) {
        self.pings += 1;
        if success {
            self.ok += 1;
        } else {
            self.errs += 1;
        }
        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.pings += 1;
        if success {
            entry.ok += 1;
        } else {
            entry.errs += 1;
        }
        self.apply_usage(model, usage);
    }

    fn apply_usage(&mut self, model: &str, usage: &UsageDelta) {
        self.cache_read += usage.cache_read;
        self.cache_write += usage.cache_write;
        self.input += usage.input;
        self.output += usage.output;

        let entry = self.per_model.entry(model.to_string()).or_default();
        entry.cache_read += usage.cache_read;
        entry.cache_write += usage.cache_write;
        entry.input += usage.input;
        entry.output += usage.output;
    }

    /// Records a prefix-hash change, bumping `prefix_changes` and appending
    /// to the bounded ring. No-op if `to_hash` equals the last recorded hash.
    pub fn record_prefix_change(&mut self, from_hash: Option<String>, to_hash: &str, model: &str, timestamp: i64) {
        if from_hash.as_deref() == Some(to_hash) {
            return;
        }
        self.prefix_changes += 1;
        self.recent_changes.push_back(PrefixChange {
            timestamp,
            from_hash,
            to_hash: to_hash.to_string(),
            model: model.to_string(),
        });
        while self.recent_changes.len() > RING_CAPACITY {
            self.recent_changes.pop_front();
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        pricing::cache_hit_rate(self.cache_read, self.cache_write, self.input)
    }

    pub fn cost_estimate(&self) -> f64 {
        pricing::total_cost(self.input, self.output, self.cache_write, self.cache_read)
    }

    /// Additive merge used when restoring persisted stats on startup: every
    /// counter adds, and the ring keeps the most recent `RING_CAPACITY`
    /// entries across both sets.
    pub fn merge(&mut self, other: Stats) {
        self.reqs += other.reqs;
        self.pings += other.pings;
        self.ok += other.ok;
        self.errs += other.errs;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.input += other.input;
        self.output += other.output;
        self.prefix_changes += other.prefix_changes;

        for (model, stats) in other.per_model {
            let entry = self.per_model.entry(model).or_default();
            entry.reqs += stats.reqs;
            entry.pings += stats.pings;
            entry.ok += stats.ok;
            entry.errs += stats.errs;
            entry.cache_read += stats.cache_read;
            entry.cache_write += stats.cache_write;
            entry.input += stats.input;
            entry.output += stats.output;
        }

        for change in other.recent_changes {
            self.recent_changes.push_back(change);
        }
        while self.recent_changes.len() > RING_CAPACITY {
            self.recent_changes.pop_front();
        }
    }

    pub fn load_from(path: &Path) -> Stats {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Stats::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).unwrap_or_default();
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_prefix_is_stable_across_whitespace() {
        let a = hash_prefix("claude-x", Some("sys"), None);
        let b = hash_prefix("claude-x", Some("sys"), None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn hash_prefix_changes_with_system() {
        let a = hash_prefix("claude-x", Some("sys one"), None);
        let b = hash_prefix("claude-x", Some("sys two"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn ring_stays_bounded() {
        let mut stats = Stats::default();
        for i in 0..30 {
            stats.record_prefix_change(Some(format!("h{}", i)), &format!("h{}", i + 1), "claude-x", i);
        }
        assert_eq!(stats.recent_changes.len(), RING_CAPACITY);
    }

    #[test]
    fn merge_is_additive() {
        let mut a = Stats::default();
        a.reqs = 5;
        let mut b = Stats::default();
        b.reqs = 3;
        a.merge(b);
        assert_eq!(a.reqs, 8);
    }

    #[test]
    fn record_prefix_change_is_noop_when_unchanged() {
        let mut stats = Stats::default();
        stats.record_prefix_change(Some("h1".to_string()), "h1", "claude-x", 0);
        assert_eq!(stats.prefix_changes, 0);
    }
}
