//! Diagnostic verbosity of the transport stack.
//!
//! The manager is handed a [`LevelControl`] at construction; tests use the
//! in-memory one.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::Serialize;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Verbosity levels understood by `debug`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DebugLevel {
    NotSet,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl DebugLevel {
    pub const ALL: [DebugLevel; 6] = [
        DebugLevel::Critical,
        DebugLevel::Error,
        DebugLevel::Warning,
        DebugLevel::Info,
        DebugLevel::Debug,
        DebugLevel::NotSet,
    ];

    pub fn value(self) -> u8 {
        match self {
            DebugLevel::Critical => 50,
            DebugLevel::Error => 40,
            DebugLevel::Warning => 30,
            DebugLevel::Info => 20,
            DebugLevel::Debug => 10,
            DebugLevel::NotSet => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DebugLevel::Critical => "CRITICAL",
            DebugLevel::Error => "ERROR",
            DebugLevel::Warning => "WARNING",
            DebugLevel::Info => "INFO",
            DebugLevel::Debug => "DEBUG",
            DebugLevel::NotSet => "NOTSET",
        }
    }

    /// `EnvFilter` directive with the same meaning.
    ///
    /// tracing has no level above error, so CRITICAL and ERROR collapse;
    /// NOTSET lets everything through.
    pub fn filter_directive(self) -> &'static str {
        match self {
            DebugLevel::Critical | DebugLevel::Error => "error",
            DebugLevel::Warning => "warn",
            DebugLevel::Info => "info",
            DebugLevel::Debug => "debug",
            DebugLevel::NotSet => "trace",
        }
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

impl FromStr for DebugLevel {
    type Err = String;

    /// Accepts a level name in any case or its numeric value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase();
        DebugLevel::ALL
            .into_iter()
            .find(|level| level.name() == wanted || level.value().to_string() == wanted)
            .ok_or_else(|| format!("not sure what this level means: {}", wanted))
    }
}

/// Get/set access to the transport library's verbosity
pub trait LevelControl: Send + Sync {
    fn level(&self) -> DebugLevel;
    fn set_level(&self, level: DebugLevel) -> Result<(), String>;
}

/// Level kept in memory only; nothing is reconfigured
#[derive(Debug)]
pub struct MemoryLevelControl {
    current: Mutex<DebugLevel>,
}

impl MemoryLevelControl {
    pub fn new(level: DebugLevel) -> Self {
        Self {
            current: Mutex::new(level),
        }
    }
}

impl LevelControl for MemoryLevelControl {
    fn level(&self) -> DebugLevel {
        self.current
            .lock()
            .map(|guard| *guard)
            .unwrap_or(DebugLevel::Warning)
    }

    fn set_level(&self, level: DebugLevel) -> Result<(), String> {
        let mut guard = self.current.lock().map_err(|e| e.to_string())?;
        *guard = level;
        Ok(())
    }
}

/// Drives the `EnvFilter` of the installed tracing subscriber
pub struct ReloadLevelControl {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Mutex<DebugLevel>,
}

impl ReloadLevelControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>, initial: DebugLevel) -> Self {
        Self {
            handle,
            current: Mutex::new(initial),
        }
    }
}

impl LevelControl for ReloadLevelControl {
    fn level(&self) -> DebugLevel {
        self.current
            .lock()
            .map(|guard| *guard)
            .unwrap_or(DebugLevel::Warning)
    }

    fn set_level(&self, level: DebugLevel) -> Result<(), String> {
        self.handle
            .reload(EnvFilter::new(level.filter_directive()))
            .map_err(|e| format!("could not change log filter: {}", e))?;
        let mut guard = self.current.lock().map_err(|e| e.to_string())?;
        *guard = level;
        Ok(())
    }
}

impl fmt::Debug for ReloadLevelControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadLevelControl")
            .field("current", &self.level())
            .finish()
    }
}
