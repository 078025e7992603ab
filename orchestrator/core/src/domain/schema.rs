// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Schema-defining resources. A Ship job never starts while a running Vibe job holds
//! a lock on one of these.

use regex::Regex;
use std::collections::BTreeSet;

/// Glob patterns where `*` matches any run of characters (including `/`).
#[derive(Debug, Clone)]
pub struct SchemaMatcher {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl SchemaMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let compiled = patterns
            .iter()
            .map(|p| glob_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, compiled })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            compiled: Vec::new(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_schema(&self, resource: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(resource))
    }

    pub fn any_schema(&self, resources: &BTreeSet<String>) -> bool {
        resources.iter().any(|r| self.is_schema(r))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}
