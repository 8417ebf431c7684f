//! Per-run token usage

use serde::{Deserialize, Serialize};

use crate::providers::Usage;

/// Token totals for one `run()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.input_tokens + usage.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut acc = UsageAccumulator::new();
        acc.record(&Usage::new(100, 20));
        acc.record(&Usage::new(50, 5));
        assert_eq!(acc.input_tokens, 150);
        assert_eq!(acc.output_tokens, 25);
        assert_eq!(acc.total_tokens, 175);
    }
}
