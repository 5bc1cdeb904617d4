//! Cost accounting for the prompt-cache keepalive daemon.
//!
//! Pricing is a single flat-rate table (not per-model) since P-Keepalive only
//! ever talks to one upstream account at a time; per-model breakdown lives in
//! `proxy::keepalive::stats` instead.

/// USD per 1,000,000 tokens.
#[derive(Debug, Clone, Copy)]
pub struct PricingTable {
    pub input: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub output: f64,
}

pub const PRICING: PricingTable = PricingTable {
    input: 3.0,
    cache_read: 0.3,
    cache_write: 3.75,
    output: 15.0,
};

/// Tokens a single keepalive ping consumes against the cached prefix.
const PING_TOKEN_ESTIMATE: u64 = 50_000;

/// USD saved by reading `cache_read_tokens` from cache instead of paying full input price.
pub fn cache_savings(cache_read_tokens: u64) -> f64 {
    cache_read_tokens as f64 * (PRICING.input - PRICING.cache_read) / 1_000_000.0
}

/// USD overhead paid to write `cache_write_tokens` into the cache.
pub fn cache_overhead(cache_write_tokens: u64) -> f64 {
    cache_write_tokens as f64 * (PRICING.cache_write - PRICING.input) / 1_000_000.0
}

/// Estimated USD cost of the keepalive pings sent so far.
pub fn ping_cost(pings: u64) -> f64 {
    pings as f64 * PING_TOKEN_ESTIMATE as f64 * PRICING.cache_read / 1_000_000.0
}

/// Fraction of input-shaped tokens that were served from cache.
pub fn cache_hit_rate(cache_read: u64, cache_write: u64, input: u64) -> f64 {
    let total = cache_read + cache_write + input;
    if total == 0 {
        return 0.0;
    }
    cache_read as f64 / total as f64
}

/// Total USD cost across all counted token categories.
pub fn total_cost(input: u64, output: u64, cache_write: u64, cache_read: u64) -> f64 {
    let input_cost = input as f64 / 1_000_000.0 * PRICING.input;
    let output_cost = output as f64 / 1_000_000.0 * PRICING.output;
    let write_cost = cache_write as f64 / 1_000_000.0 * PRICING.cache_write;
    let read_cost = cache_read as f64 / 1_000_000.0 * PRICING.cache_read;
    input_cost + output_cost + write_cost + read_cost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_savings_is_positive() {
        // 10k cache-read tokens: full price would be $0.03, cache price $0.003
        assert!((cache_savings(10_000) - 0.027).abs() < 1e-9);
    }

    #[test]
    fn cache_overhead_is_positive() {
        // 10k cache-write tokens: write is pricier than plain input
        assert!((cache_overhead(10_000) - 0.0075).abs() < 1e-9);
    }

    #[test]
    fn ping_cost_uses_cache_read_rate() {
        assert!((ping_cost(2) - 0.03).abs() < 1e-9);
    }

    #[test]
    fn hit_rate_handles_zero_total() {
        assert_eq!(cache_hit_rate(0, 0, 0), 0.0);
    }

    #[test]
    fn hit_rate_all_cache_read() {
        assert_eq!(cache_hit_rate(100, 0, 0), 1.0);
    }

    #[test]
    fn total_cost_matches_components() {
        let cost = total_cost(1_000_000, 1_000_000, 0, 0);
        assert!((cost - 18.0).abs() < 1e-9);
    }
}
