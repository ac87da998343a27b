use crate::config::HealthConfig;
use chrono::{DateTime, Utc};

/// Classifies hub liveness from its failure streak and time since last success.
#[derive(Debug, Clone, Copy)]
pub struct HealthEvaluator {
    config: HealthConfig,
}

impl HealthEvaluator {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn is_healthy(&self, consecutive_failures: i32) -> bool {
        consecutive_failures < self.config.failure_threshold
    }

    /// A hub that has never succeeded is not flagged for silence; only its
    /// failure streak counts.
    pub fn needs_attention(
        &self,
        last_success_at: Option<DateTime<Utc>>,
        consecutive_failures: i32,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_healthy(consecutive_failures) {
            return true;
        }
        match last_success_at {
            Some(at) => now - at > self.config.max_silence,
            None => false,
        }
    }
}
