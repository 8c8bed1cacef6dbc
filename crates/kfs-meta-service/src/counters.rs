//! Per-op completion counters, reported through STATS.

use std::collections::BTreeMap;
use std::fmt::Write as _;

#[derive(Debug, Default)]
pub struct OpCounters {
    counts: BTreeMap<&'static str, u64>,
}

impl OpCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &'static str) {
        *self.counts.entry(name).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    /// One `name: count` line per op, in name order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, count) in &self.counts {
            let _ = writeln!(out, "{}: {}", name, count);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_render() {
        let mut c = OpCounters::new();
        c.update("create");
        c.update("create");
        c.update("lookup");
        assert_eq!(c.get("create"), 2);
        assert_eq!(c.get("missing"), 0);
        assert_eq!(c.render(), "create: 2\nlookup: 1\n");
    }
}
