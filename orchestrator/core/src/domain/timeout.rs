// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Soft/hard deadlines, measured from the moment a job starts running.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::job::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Wind-down point: finish the current step, checkpoint, start nothing new.
    #[serde(with = "humantime_serde")]
    pub soft: Duration,
    /// Forced termination.
    #[serde(with = "humantime_serde")]
    pub hard: Duration,
}

impl TimeoutPolicy {
    pub const fn new(soft: Duration, hard: Duration) -> Self {
        Self { soft, hard }
    }

    pub fn default_for(kind: JobKind) -> Self {
        const MIN: u64 = 60;
        let (soft, hard) = match kind {
            JobKind::Vibe => (15, 20),
            JobKind::Fix => (10, 15),
            JobKind::Style => (5, 8),
            JobKind::Ship => (5, 10),
        };
        Self::new(Duration::from_secs(soft * MIN), Duration::from_secs(hard * MIN))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.soft.is_zero() || self.hard.is_zero() {
            return Err("timeouts must be greater than zero".to_string());
        }
        if self.soft > self.hard {
            return Err(format!(
                "soft timeout ({}s) must not exceed hard timeout ({}s)",
                self.soft.as_secs(),
                self.hard.as_secs()
            ));
        }
        Ok(())
    }
}

/// How long a Ship job in post-deploy verification may overrun its hard deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    #[serde(with = "humantime_serde")]
    pub extension: Duration,
    pub max_extensions: u32,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            extension: Duration::from_secs(120),
            max_extensions: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_kind() {
        let vibe = TimeoutPolicy::default_for(JobKind::Vibe);
        assert_eq!(vibe.soft, Duration::from_secs(15 * 60));
        assert_eq!(vibe.hard, Duration::from_secs(20 * 60));
        for kind in JobKind::ALL {
            assert!(TimeoutPolicy::default_for(kind).validate().is_ok());
        }
    }

    #[test]
    fn test_soft_after_hard_is_invalid() {
        let policy = TimeoutPolicy::new(Duration::from_secs(10), Duration::from_secs(5));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_parses_humantime() {
        let policy: TimeoutPolicy = serde_yaml::from_str("soft: 90s\nhard: 2m").unwrap();
        assert_eq!(policy.soft, Duration::from_secs(90));
        assert_eq!(policy.hard, Duration::from_secs(120));
    }
}
