//! Per-channel capacity rules.
//!
//! Capacity for a channel resolves in this order:
//! 1. exact-name override
//! 2. pattern override (`*` wildcards, most specific pattern first)
//! 3. global default
//!
//! Only `*` and `[...]` are wildcards in patterns. `?` and `!` are channel
//! markers and always match literally.

use std::collections::HashMap;

use glob::Pattern;

use crate::layer::{LayerError, Result};

/// Compiled capacity rule set.
#[derive(Debug, Clone)]
pub struct CapacityRules {
    default: usize,
    exact: HashMap<String, usize>,
    /// Sorted most specific first.
    patterns: Vec<(Pattern, usize)>,
}

fn is_pattern(key: &str) -> bool {
    key.contains('*') || key.contains('[')
}

impl CapacityRules {
    /// Compile rules from the config map (`name or pattern -> capacity`).
    pub fn new(default: usize, overrides: &HashMap<String, usize>) -> Result<Self> {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();

        for (key, &capacity) in overrides {
            if is_pattern(key) {
                let escaped = key.replace('?', "[?]");
                let pattern = Pattern::new(&escaped).map_err(|e| {
                    LayerError::Config(format!("Invalid capacity pattern '{}': {}", key, e))
                })?;
                patterns.push((pattern, capacity));
            } else {
                exact.insert(key.clone(), capacity);
            }
        }

        // Longer literal text first so `http.response!*` beats `http.*`.
        patterns.sort_by(|(a, _), (b, _)| {
            let literal = |p: &Pattern| p.as_str().chars().filter(|c| *c != '*').count();
            literal(b)
                .cmp(&literal(a))
                .then_with(|| a.as_str().cmp(b.as_str()))
        });

        Ok(Self {
            default,
            exact,
            patterns,
        })
    }

    /// Rules with only a global default.
    pub fn uniform(default: usize) -> Self {
        Self {
            default,
            exact: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Capacity for a channel name.
    pub fn capacity_for(&self, channel: &str) -> usize {
        if let Some(&capacity) = self.exact.get(channel) {
            return capacity;
        }
        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.matches(channel))
            .map(|(_, capacity)| *capacity)
            .unwrap_or(self.default)
    }

    pub fn default_capacity(&self) -> usize {
        self.default
    }
}
