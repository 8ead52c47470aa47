//! Caller-supplied time limit for a single estimation

use std::time::{Duration, Instant};

use crate::error::{Result, ScnormError};

/// Wall-clock budget started when an estimation begins
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Fail with `Timeout` once the budget is spent
    pub fn check(&self, stage: &str) -> Result<()> {
        if let Some(limit) = self.limit {
            let elapsed = self.start.elapsed();
            if elapsed >= limit {
                return Err(ScnormError::Timeout {
                    stage: stage.to_string(),
                    elapsed_ms: elapsed.as_millis(),
                });
            }
        }
        Ok(())
    }
}
