// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocklists for routes and queues that should never be aggregated.

use regex::Regex;

use crate::errors::ConfigError;

/// One blocklist entry.
#[derive(Debug, Clone)]
pub enum KeyMatcher {
    Exact(String),
    Pattern(Regex),
}

impl KeyMatcher {
    /// Parses one entry. Entries wrapped in slashes (`/^/health/`) are
    /// regular expressions, anything else is matched literally.
    pub fn parse(entry: &str) -> Result<Self, ConfigError> {
        let entry = entry.trim();
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if !pattern.is_empty() => Regex::new(pattern)
                .map(KeyMatcher::Pattern)
                .map_err(|e| ConfigError::Pattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                }),
            _ => Ok(KeyMatcher::Exact(entry.to_string())),
        }
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(exact) => exact == key,
            KeyMatcher::Pattern(re) => re.is_match(key),
        }
    }
}

impl PartialEq for KeyMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyMatcher::Exact(a), KeyMatcher::Exact(b)) => a == b,
            (KeyMatcher::Pattern(a), KeyMatcher::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blocklist {
    matchers: Vec<KeyMatcher>,
}

impl Blocklist {
    #[must_use]
    pub fn new(matchers: Vec<KeyMatcher>) -> Self {
        Blocklist { matchers }
    }

    /// Parses a comma separated list of entries, skipping empty ones.
    pub fn from_env_string(value: &str) -> Result<Self, ConfigError> {
        value
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(KeyMatcher::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Blocklist::new)
    }

    #[must_use]
    pub fn is_blocked(&self, key: &str) -> bool {
        self.matchers.iter().any(|m| m.matches(key))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}
