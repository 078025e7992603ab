// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Retry Policy Engine
//!
//! Classifies executor failures into an [`ErrorClass`] and decides, as a pure function of
//! `(class, attempts_made)`, what happens next.
//!
//! | class | retries | backoff | when exhausted |
//! |-------|---------|---------|----------------|
//! | transient | 3 | 1s, 2s, 4s | abort |
//! | build | 1 | immediate | abort with diagnostic |
//! | deploy | 1 | immediate | rollback |
//! | auth | 0 | n/a | abort |
//! | unclassified | 0 | n/a | abort with full context |
//!
//! All of the above is configuration ([`RetryConfig`]); the table shows the defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::domain::executor::ExecutorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[serde(alias = "network")]
    Transient,
    Build,
    Deploy,
    #[serde(alias = "permission")]
    Auth,
    Unclassified,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Build => "build",
            ErrorClass::Deploy => "deploy",
            ErrorClass::Auth => "auth",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transient" | "network" => Ok(ErrorClass::Transient),
            "build" => Ok(ErrorClass::Build),
            "deploy" => Ok(ErrorClass::Deploy),
            "auth" | "permission" => Ok(ErrorClass::Auth),
            "unclassified" => Ok(ErrorClass::Unclassified),
            other => Err(format!("unknown error class '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    RetryImmediately,
    Rollback,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionAction {
    #[default]
    Abort,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry as soon as the job can be dispatched again.
    #[default]
    None,
    /// `initial * multiplier^(attempt - 1)`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(default = "default_multiplier")]
        multiplier: u32,
    },
}

fn default_multiplier() -> u32 {
    2
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Option<Duration> {
        match self {
            Backoff::None => None,
            Backoff::Exponential { initial, multiplier } => {
                let factor = multiplier.saturating_pow(retry.saturating_sub(1));
                Some(initial.saturating_mul(factor))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub on_exhausted: ExhaustionAction,
}

impl ClassRetryPolicy {
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
            on_exhausted: ExhaustionAction::Abort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(alias = "network", default = "default_transient")]
    pub transient: ClassRetryPolicy,
    #[serde(default = "default_build")]
    pub build: ClassRetryPolicy,
    #[serde(default = "default_deploy")]
    pub deploy: ClassRetryPolicy,
    #[serde(default = "ClassRetryPolicy::never")]
    pub auth: ClassRetryPolicy,
    #[serde(default = "ClassRetryPolicy::never")]
    pub unclassified: ClassRetryPolicy,
}

fn default_transient() -> ClassRetryPolicy {
    ClassRetryPolicy {
        max_retries: 3,
        backoff: Backoff::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2,
        },
        on_exhausted: ExhaustionAction::Abort,
    }
}

fn default_build() -> ClassRetryPolicy {
    ClassRetryPolicy {
        max_retries: 1,
        backoff: Backoff::None,
        on_exhausted: ExhaustionAction::Abort,
    }
}

fn default_deploy() -> ClassRetryPolicy {
    ClassRetryPolicy {
        max_retries: 1,
        backoff: Backoff::None,
        on_exhausted: ExhaustionAction::Rollback,
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transient: default_transient(),
            build: default_build(),
            deploy: default_deploy(),
            auth: ClassRetryPolicy::never(),
            unclassified: ClassRetryPolicy::never(),
        }
    }
}

impl RetryConfig {
    pub fn for_class(&self, class: ErrorClass) -> &ClassRetryPolicy {
        match class {
            ErrorClass::Transient => &self.transient,
            ErrorClass::Build => &self.build,
            ErrorClass::Deploy => &self.deploy,
            ErrorClass::Auth => &self.auth,
            ErrorClass::Unclassified => &self.unclassified,
        }
    }
}

/// Per-job retry bookkeeping, owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub error_class: ErrorClass,
    pub attempts_made: u32,
    pub backoff_until: Option<tokio::time::Instant>,
}

impl RetryState {
    pub fn new(error_class: ErrorClass) -> Self {
        Self {
            error_class,
            attempts_made: 0,
            backoff_until: None,
        }
    }
}

// sysexits.h
const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // 5xx codes only count next to an HTTP context
    Regex::new(concat!(
        r"(?i)\b(network|connection (reset|refused|closed)|timed? ?out|temporarily unavailable|dns|econnreset|rate limit(ed)?",
        r"|(http(/\d(\.\d)?)?|status( code)?):? ?5\d\d\b",
        r"|5\d\d (internal server error|bad gateway|service unavailable|gateway time-?out))",
    ))
    .expect("transient pattern is valid")
});

static AUTH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(permission denied|access denied|unauthori[sz]ed|forbidden|\b401\b|\b403\b|invalid (token|credentials)|authentication failed)")
        .expect("auth pattern is valid")
});

static DEPLOY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(deploy(ment)?|rollout)\b").expect("deploy pattern is valid")
});

static BUILD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bbuild\b|\bcompil(e|ation|er)\b|error\[E\d+\]|type ?error|syntax ?error)")
        .expect("build pattern is valid")
});

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Explicit hint first, then the exit status, then message patterns.
    pub fn classify(&self, error: &ExecutorError) -> ErrorClass {
        if let Some(hint) = error.class_hint {
            return hint;
        }
        match error.exit_code {
            Some(EX_TEMPFAIL) => return ErrorClass::Transient,
            Some(EX_NOPERM) => return ErrorClass::Auth,
            _ => {}
        }

        // auth before transient: "403 Forbidden" must never be retried
        let text = error.message.as_str();
        if AUTH_PATTERN.is_match(text) {
            ErrorClass::Auth
        } else if TRANSIENT_PATTERN.is_match(text) {
            ErrorClass::Transient
        } else if DEPLOY_PATTERN.is_match(text) {
            ErrorClass::Deploy
        } else if BUILD_PATTERN.is_match(text) {
            ErrorClass::Build
        } else {
            ErrorClass::Unclassified
        }
    }

    /// `attempts_made` counts retries already scheduled for this class.
    pub fn decide(&self, class: ErrorClass, attempts_made: u32) -> RetryDecision {
        let policy = self.config.for_class(class);
        if attempts_made < policy.max_retries {
            return match policy.backoff.delay(attempts_made + 1) {
                Some(delay) if !delay.is_zero() => RetryDecision::RetryAfter(delay),
                _ => RetryDecision::RetryImmediately,
            };
        }
        match policy.on_exhausted {
            ExhaustionAction::Abort => RetryDecision::Abort,
            ExhaustionAction::Rollback => RetryDecision::Rollback,
        }
    }

    /// Folds a new failure into the job's retry state and returns the decision.
    /// A class change restarts the count for the new class.
    pub fn record(&self, state: &mut Option<RetryState>, class: ErrorClass) -> RetryDecision {
        if state.as_ref().map(|s| s.error_class) != Some(class) {
            *state = Some(RetryState::new(class));
        }
        let entry = state.get_or_insert_with(|| RetryState::new(class));
        let decision = self.decide(class, entry.attempts_made);
        match decision {
            RetryDecision::RetryAfter(delay) => {
                entry.attempts_made += 1;
                entry.backoff_until = Some(tokio::time::Instant::now() + delay);
            }
            RetryDecision::RetryImmediately => {
                entry.attempts_made += 1;
                entry.backoff_until = None;
            }
            RetryDecision::Rollback | RetryDecision::Abort => {
                entry.backoff_until = None;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(message: &str) -> ExecutorError {
        ExecutorError::new(message)
    }

    #[test]
    fn test_classify_by_hint_exit_code_and_message() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.classify(&ExecutorError::deploy("anything")), ErrorClass::Deploy);
        assert_eq!(policy.classify(&error("boom").with_exit_code(75)), ErrorClass::Transient);
        assert_eq!(policy.classify(&error("boom").with_exit_code(77)), ErrorClass::Auth);
        assert_eq!(policy.classify(&error("connection reset by peer")), ErrorClass::Transient);
        assert_eq!(policy.classify(&error("HTTP 403 Forbidden")), ErrorClass::Auth);
        assert_eq!(policy.classify(&error("Deployment health check failed")), ErrorClass::Deploy);
        assert_eq!(policy.classify(&error("error[E0308]: mismatched types")), ErrorClass::Build);
        assert_eq!(policy.classify(&error("something odd")), ErrorClass::Unclassified);
    }

    #[test]
    fn test_compiler_output_is_not_mistaken_for_server_errors() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.classify(&error("cargo build --release failed")), ErrorClass::Build);
        assert_eq!(
            policy.classify(&error("error[E0308]: mismatched types --> src/lib.rs:512:9")),
            ErrorClass::Build
        );
        assert_eq!(policy.classify(&error("HTTP 503 Service Unavailable")), ErrorClass::Transient);
        assert_eq!(policy.classify(&error("upstream returned status 502")), ErrorClass::Transient);
        assert_eq!(policy.classify(&error("504 Gateway Timeout")), ErrorClass::Transient);
    }

    #[test]
    fn test_network_error_four_times_backs_off_then_aborts() {
        let policy = RetryPolicy::default();
        let mut state = None;
        let decisions: Vec<RetryDecision> = (0..4)
            .map(|_| policy.record(&mut state, ErrorClass::Transient))
            .collect();

        assert_eq!(
            decisions,
            vec![
                RetryDecision::RetryAfter(Duration::from_secs(1)),
                RetryDecision::RetryAfter(Duration::from_secs(2)),
                RetryDecision::RetryAfter(Duration::from_secs(4)),
                RetryDecision::Abort,
            ]
        );
        assert_eq!(state.map(|s| s.attempts_made), Some(3));
    }

    #[test]
    fn test_auth_is_never_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(ErrorClass::Auth, 0), RetryDecision::Abort);
        assert_eq!(policy.decide(ErrorClass::Unclassified, 0), RetryDecision::Abort);
    }

    #[test]
    fn test_build_retries_once_and_deploy_rolls_back() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(ErrorClass::Build, 0), RetryDecision::RetryImmediately);
        assert_eq!(policy.decide(ErrorClass::Build, 1), RetryDecision::Abort);
        assert_eq!(policy.decide(ErrorClass::Deploy, 0), RetryDecision::RetryImmediately);
        assert_eq!(policy.decide(ErrorClass::Deploy, 1), RetryDecision::Rollback);
    }

    #[test]
    fn test_class_change_restarts_count() {
        let policy = RetryPolicy::default();
        let mut state = None;
        policy.record(&mut state, ErrorClass::Transient);
        policy.record(&mut state, ErrorClass::Transient);

        assert_eq!(policy.record(&mut state, ErrorClass::Build), RetryDecision::RetryImmediately);
        let state = state.unwrap();
        assert_eq!(state.error_class, ErrorClass::Build);
        assert_eq!(state.attempts_made, 1);
    }

    #[test]
    fn test_retry_config_from_yaml() {
        let yaml = r#"
network:
  max_retries: 2
  backoff: { type: exponential, initial: 500ms }
build: { max_retries: 0 }
deploy: { max_retries: 2, on_exhausted: rollback }
"#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        let policy = RetryPolicy::new(config);
        assert_eq!(
            policy.decide(ErrorClass::Transient, 1),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(policy.decide(ErrorClass::Build, 0), RetryDecision::Abort);
        assert_eq!(policy.decide(ErrorClass::Deploy, 2), RetryDecision::Rollback);
    }
}
