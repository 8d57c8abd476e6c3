// ============================================================================
// Quorum Policies
// ============================================================================
//
// A quorum check decides whether `satisfied` out of `total` considered
// entities is enough for a rollup to count as healthy. The named presets are
// all numeric checks of the form:
//
//   allow_empty && total == 0                 -> quorate
//   satisfied < min_required                  -> not quorate
//   satisfied < total * min_ratio             -> not quorate
//   otherwise                                 -> quorate
//
// ============================================================================

use crate::core::{Result, StateError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub trait QuorumCheck: Send + Sync {
    fn is_quorate(&self, satisfied: usize, total: usize) -> bool;
}

impl<F> QuorumCheck for F
where
    F: Fn(usize, usize) -> bool + Send + Sync,
{
    fn is_quorate(&self, satisfied: usize, total: usize) -> bool {
        self(satisfied, total)
    }
}

#[derive(Clone)]
pub enum QuorumPolicy {
    /// Every considered entity must be satisfied; zero considered is fine
    All,
    /// Every considered entity, and at least one
    AllAndAtLeastOne,
    AtLeastOne,
    /// Zero considered is fine, otherwise at least one
    AtLeastOneUnlessEmpty,
    AlwaysHealthy,
    AtLeast(usize),
    Numeric {
        min_required: usize,
        min_ratio: f64,
        allow_empty: bool,
    },
    Custom {
        name: String,
        check: Arc<dyn QuorumCheck>,
    },
}

impl QuorumPolicy {
    pub fn custom<F>(name: &str, check: F) -> Self
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        QuorumPolicy::Custom {
            name: name.to_string(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> String {
        match self {
            QuorumPolicy::All => "all".to_string(),
            QuorumPolicy::AllAndAtLeastOne => "allAndAtLeastOne".to_string(),
            QuorumPolicy::AtLeastOne => "atLeastOne".to_string(),
            QuorumPolicy::AtLeastOneUnlessEmpty => "atLeastOneUnlessEmpty".to_string(),
            QuorumPolicy::AlwaysHealthy => "alwaysHealthy".to_string(),
            QuorumPolicy::AtLeast(n) => format!("atLeast({})", n),
            QuorumPolicy::Numeric {
                min_required,
                min_ratio,
                allow_empty,
            } => format!(
                "numeric(min={}, ratio={}, allowEmpty={})",
                min_required, min_ratio, allow_empty
            ),
            QuorumPolicy::Custom { name, .. } => name.clone(),
        }
    }
}

fn numeric(satisfied: usize, total: usize, min_required: usize, min_ratio: f64, allow_empty: bool) -> bool {
    if allow_empty && total == 0 {
        return true;
    }
    if satisfied < min_required {
        return false;
    }
    if (satisfied as f64) < (total as f64) * min_ratio - 1e-9 {
        return false;
    }
    true
}

impl QuorumCheck for QuorumPolicy {
    fn is_quorate(&self, satisfied: usize, total: usize) -> bool {
        match self {
            QuorumPolicy::All => numeric(satisfied, total, 0, 1.0, false),
            QuorumPolicy::AllAndAtLeastOne => numeric(satisfied, total, 1, 1.0, false),
            QuorumPolicy::AtLeastOne => numeric(satisfied, total, 1, 0.0, false),
            QuorumPolicy::AtLeastOneUnlessEmpty => numeric(satisfied, total, 1, 0.0, true),
            QuorumPolicy::AlwaysHealthy => true,
            QuorumPolicy::AtLeast(n) => numeric(satisfied, total, *n, 0.0, false),
            QuorumPolicy::Numeric {
                min_required,
                min_ratio,
                allow_empty,
            } => numeric(satisfied, total, *min_required, *min_ratio, *allow_empty),
            QuorumPolicy::Custom { check, .. } => check.is_quorate(satisfied, total),
        }
    }
}

impl fmt::Debug for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuorumPolicy({})", self.name())
    }
}

impl fmt::Display for QuorumPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl PartialEq for QuorumPolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (QuorumPolicy::Custom { check: a, .. }, QuorumPolicy::Custom { check: b, .. }) => {
                Arc::ptr_eq(a, b)
            }
            (QuorumPolicy::Custom { .. }, _) | (_, QuorumPolicy::Custom { .. }) => false,
            _ => self.name() == other.name(),
        }
    }
}

/// Parses the preset names, case-insensitively and ignoring `-`/`_`:
/// `all`, `allAndAtLeastOne`, `atLeastOne`, `atLeastOneUnlessEmpty`,
/// `alwaysHealthy` (or `alwaysTrue`), `atLeast(N)`, `atLeastN`, or a bare `N`.
impl FromStr for QuorumPolicy {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();

        let policy = match normalized.as_str() {
            "all" => QuorumPolicy::All,
            "allandatleastone" => QuorumPolicy::AllAndAtLeastOne,
            "atleastone" => QuorumPolicy::AtLeastOne,
            "atleastoneunlessempty" => QuorumPolicy::AtLeastOneUnlessEmpty,
            "alwayshealthy" | "alwaystrue" => QuorumPolicy::AlwaysHealthy,
            other => {
                let count = other
                    .strip_prefix("atleast")
                    .map(|rest| rest.trim_start_matches('(').trim_end_matches(')'))
                    .unwrap_or(other);
                let n = count.parse::<usize>().map_err(|_| {
                    StateError::InvalidConfiguration(format!("unknown quorum check '{}'", s))
                })?;
                QuorumPolicy::AtLeast(n)
            }
        };
        Ok(policy)
    }
}
