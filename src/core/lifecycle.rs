// ============================================================================
// Lifecycle States and Transitions
// ============================================================================
//
// `LifecycleState` is a closed set of phases with no ordering between them.
// Its string form is lowercase-hyphenated (`ON_FIRE` <-> "on-fire").
//
// Decoding a state is fail-safe: anything unrecognized becomes `OnFire`.
// Decoding a `Transition` is strict: a string not of the form
// "<state> @ <epoch-millis>..." is rejected.
//
// ============================================================================

use crate::core::{Result, StateError};
use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref TRANSITION_PATTERN: Regex =
        Regex::new(r"^([\w-]+)\s+@\s+(\d+).*").expect("transition pattern is valid");
}

/// Coarse-grained phase of a managed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
    /// Error state; also the result of decoding an unrecognized token
    OnFire,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        LifecycleState::Created,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Destroyed,
        LifecycleState::OnFire,
    ];

    /// Canonical lowercase-hyphenated form, e.g. `"on-fire"`
    pub fn canonical_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
            Self::OnFire => "on-fire",
        }
    }

    /// Decode a state token.
    ///
    /// Accepts the canonical form as well as the upper-snake form (`"ON_FIRE"`),
    /// case-insensitively. Any other input yields `OnFire` rather than an error,
    /// so a garbled report is always treated as unhealthy.
    pub fn parse(value: &str) -> LifecycleState {
        Self::try_parse(value).unwrap_or(LifecycleState::OnFire)
    }

    /// Strict variant of [`LifecycleState::parse`]
    pub fn try_parse(value: &str) -> Option<LifecycleState> {
        let normalized = value.to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.canonical_str() == normalized)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_str())
    }
}

impl FromStr for LifecycleState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(LifecycleState::parse(s))
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.canonical_str())
    }
}

impl<'de> Deserialize<'de> for LifecycleState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(LifecycleState::parse(&raw))
    }
}

/// The expected (declared) state of an entity as of a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    state: LifecycleState,
    timestamp_utc: i64,
}

impl Transition {
    pub fn new(state: LifecycleState, timestamp_utc: i64) -> Self {
        Self {
            state,
            timestamp_utc,
        }
    }

    /// Transition to `state` stamped with the current wall-clock time
    pub fn now(state: LifecycleState) -> Self {
        Self::new(state, Utc::now().timestamp_millis())
    }

    /// Build from loosely-typed parts; both are required
    pub fn try_from_parts(state: Option<LifecycleState>, timestamp_utc: Option<i64>) -> Result<Self> {
        let state = state.ok_or(StateError::MissingArgument("state"))?;
        let timestamp_utc = timestamp_utc.ok_or(StateError::MissingArgument("timestamp_utc"))?;
        Ok(Self::new(state, timestamp_utc))
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Epoch milliseconds
    pub fn timestamp_utc(&self) -> i64 {
        self.timestamp_utc
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_utc)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.state, self.timestamp_utc)?;
        if let Some(ts) = self.timestamp() {
            write!(f, " / {}", ts.to_rfc3339_opts(SecondsFormat::Millis, true))?;
        }
        Ok(())
    }
}

impl FromStr for Transition {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        let captures = TRANSITION_PATTERN
            .captures(s)
            .ok_or_else(|| StateError::MalformedTransition(s.to_string()))?;

        let state = LifecycleState::parse(&captures[1]);
        let timestamp_utc = captures[2]
            .parse::<i64>()
            .map_err(|e| StateError::MalformedTransition(format!("{}: {}", s, e)))?;

        Ok(Self::new(state, timestamp_utc))
    }
}

impl Serialize for Transition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Transition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
