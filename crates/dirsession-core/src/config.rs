//! Per-session configuration.

use serde::Deserialize;

use crate::search::Scope;

/// Defaults applied to every request a session issues, fixed at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum entries per search; 0 is unlimited.
    pub size_limit: u32,
    /// Server-side time limit in seconds; 0 is none.
    pub time_limit_secs: u32,
    pub batch_size: u32,
    pub default_scope: Scope,
    /// Page length for paged iterators created without an explicit size.
    pub page_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            size_limit: 0,
            time_limit_secs: 0,
            batch_size: 1,
            default_scope: Scope::OneLevel,
            page_size: 20,
        }
    }
}

impl SessionConfig {
    pub fn with_size_limit(mut self, limit: u32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_time_limit(mut self, seconds: u32) -> Self {
        self.time_limit_secs = seconds;
        self
    }

    pub fn with_default_scope(mut self, scope: Scope) -> Self {
        self.default_scope = scope;
        self
    }

    pub fn with_page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }
}
