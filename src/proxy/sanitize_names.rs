//! Tool-name sanitization, shared by the translating proxy (which must hand
//! upstreams a conforming name) and the pass-through sanitizing proxy (which
//! rewrites names in place).
//!
//! `mcp__*` names collapse to a 12-hex-digit MD5 prefix; everything else is
//! normalized character-by-character and truncated if still too long. Both
//! paths are deterministic, so the same original name always produces the
//! same short name within (and across) one process.

use std::collections::HashMap;

const MAX_LEN: usize = 64;

fn is_alphabet_valid(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Stateless sanitization of a single tool name. Already-conforming names
/// that aren't `mcp__`-prefixed are returned byte-identical.
pub fn sanitize_tool_name(name: &str) -> String {
    if name.starts_with("mcp__") {
        return format!("mcp_{}", &md5_hex(name)[..12]);
    }

    if is_alphabet_valid(name) && name.len() <= MAX_LEN {
        return name.to_string();
    }

    let mut normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    match normalized.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => normalized.insert(0, '_'),
    }

    if normalized.len() > MAX_LEN {
        let hex = md5_hex(name);
        let prefix_len = MAX_LEN - 1 - 6; // reserve "_" + 6 hex chars
        let prefix: String = normalized.chars().take(prefix_len).collect();
        normalized = format!("{}_{}", prefix, &hex[..6]);
    }

    normalized
}

/// Process-lifetime `short -> original` mapping. Sanitizing the same
/// original name twice returns the same short name.
#[derive(Debug, Default)]
pub struct ToolNameMap {
    short_to_original: HashMap<String, String>,
    original_to_short: HashMap<String, String>,
}

impl ToolNameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize `original`, remembering the mapping for later reversal.
    pub fn sanitize(&mut self, original: &str) -> String {
        if let Some(short) = self.original_to_short.get(original) {
            return short.clone();
        }
        let short = sanitize_tool_name(original);
        self.short_to_original
            .insert(short.clone(), original.to_string());
        self.original_to_short
            .insert(original.to_string(), short.clone());
        short
    }

    /// Reverse a short name back to the original, falling back to the input
    /// itself when it was never seen (e.g. an upstream echoed name we never
    /// sanitized this call).
    pub fn resolve(&self, short: &str) -> String {
        self.short_to_original
            .get(short)
            .cloned()
            .unwrap_or_else(|| short.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_name_passes_through() {
        assert_eq!(sanitize_tool_name("get_weather"), "get_weather");
    }

    #[test]
    fn mcp_prefixed_name_collapses_to_hash() {
        let short = sanitize_tool_name(
            "mcp__github__create_issue_with_very_long_description_suffix_here",
        );
        assert!(short.starts_with("mcp_"));
        assert_eq!(short.len(), "mcp_".len() + 12);
    }

    #[test]
    fn mcp_collapse_is_deterministic() {
        let a = sanitize_tool_name("mcp__github__create_issue");
        let b = sanitize_tool_name("mcp__github__create_issue");
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_characters_are_normalized() {
        let short = sanitize_tool_name("weather.lookup!city");
        assert!(is_alphabet_valid(&short));
    }

    #[test]
    fn overlong_name_is_truncated_with_hash_suffix() {
        let long_name = "a".repeat(100);
        let short = sanitize_tool_name(&long_name);
        assert!(short.len() <= MAX_LEN);
        assert!(is_alphabet_valid(&short));
    }

    #[test]
    fn tool_name_map_round_trips() {
        let mut map = ToolNameMap::new();
        let short = map.sanitize("mcp__github__create_issue");
        assert_eq!(map.resolve(&short), "mcp__github__create_issue");
    }

    #[test]
    fn tool_name_map_unknown_short_passes_through() {
        let map = ToolNameMap::new();
        assert_eq!(map.resolve("never_seen"), "never_seen");
    }

    #[test]
    fn tool_name_map_is_idempotent() {
        let mut map = ToolNameMap::new();
        let first = map.sanitize("get_weather");
        let second = map.sanitize("get_weather");
        assert_eq!(first, second);
    }
}
