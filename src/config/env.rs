//! Environment-derived startup decisions
//!
//! Both values are read once at startup and threaded through the bootstrap as
//! data; nothing re-reads the environment later.

use std::collections::BTreeSet;
use std::fmt;

/// Variable naming the comma-separated namespaces to watch
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

/// Variable that disables the admission path when set to `false`
pub const ENABLE_WEBHOOKS_ENV: &str = "ENABLE_WEBHOOKS";

/// Which namespaces the runtime watches
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchScope {
    /// Every namespace in the cluster
    All,
    /// Only the listed namespaces
    Namespaces(BTreeSet<String>),
}

impl WatchScope {
    /// Parse a `WATCH_NAMESPACE` value
    ///
    /// Entries are trimmed and deduplicated. An absent value, or one without
    /// any non-empty entry, means the whole cluster rather than nothing.
    pub fn parse(raw: Option<&str>) -> Self {
        let namespaces: BTreeSet<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();

        if namespaces.is_empty() {
            Self::All
        } else {
            Self::Namespaces(namespaces)
        }
    }

    /// True when no namespace restriction applies
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all namespaces"),
            Self::Namespaces(ns) => {
                let list: Vec<&str> = ns.iter().map(String::as_str).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

/// Whether the admission-mutation path is mounted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Mutation entry points are constructed and served
    Enabled,
    /// No mutation capability; unsupported reduced mode
    Disabled,
}

impl AdmissionMode {
    /// Parse an `ENABLE_WEBHOOKS` value
    ///
    /// Only an explicit `false` (any case, surrounding whitespace ignored)
    /// disables admission; anything else, including absence, enables it.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.trim().eq_ignore_ascii_case("false") => Self::Disabled,
            _ => Self::Enabled,
        }
    }
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("enabled"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

/// Startup values taken from the process environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorEnv {
    /// Namespaces to watch
    pub watch_scope: WatchScope,
    /// Admission wiring decision input
    pub admission: AdmissionMode,
    /// Name of this replica, used as the election identity
    pub pod_name: Option<String>,
    /// Namespace this replica runs in, used for the election lease
    pub pod_namespace: Option<String>,
}

impl OperatorEnv {
    /// Read everything from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read everything through `lookup`, so tests need not touch process env
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            watch_scope: WatchScope::parse(lookup(WATCH_NAMESPACE_ENV).as_deref()),
            admission: AdmissionMode::parse(lookup(ENABLE_WEBHOOKS_ENV).as_deref()),
            pod_name: lookup("POD_NAME").filter(|v| !v.is_empty()),
            pod_namespace: lookup("POD_NAMESPACE").filter(|v| !v.is_empty()),
        }
    }
}
