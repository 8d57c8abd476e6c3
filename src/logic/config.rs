// ============================================================================
// Aggregator and Expected-State Configuration
// ============================================================================
//
// Roster aggregator settings come either from the typed builder or from an
// option map keyed by `enricher.*` names. Only the quorum, ignore-state and
// publish switches may change after the aggregator is attached.
//
// ============================================================================

use super::quorum::QuorumPolicy;
use crate::core::{LifecycleState, Result, StateError};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_AGGREGATOR_TAG: &str = "service-lifecycle-indicators-from-children-and-members";
pub const DEFAULT_AGGREGATOR_UP_TAG: &str = "service-not-up-indicators-from-children-and-members";

/// Parses a quorum policy name found in an option map
pub type QuorumParser = dyn Fn(&str) -> Result<QuorumPolicy>;

pub fn default_quorum_parser(name: &str) -> Result<QuorumPolicy> {
    QuorumPolicy::from_str(name)
}

/// Roster entries in these states never count against the parent.
///
/// `None` stands for "no actual state published".
pub fn default_ignore_states() -> HashSet<Option<LifecycleState>> {
    LifecycleState::ALL
        .iter()
        .filter(|s| !matches!(s, LifecycleState::Running | LifecycleState::OnFire))
        .map(|s| Some(*s))
        .chain(std::iter::once(None))
        .collect()
}

// ============================================================================
// Option keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregatorConfigKey {
    IncludeChildren,
    IncludeMembers,
    UpQuorum,
    RunningQuorum,
    PublishNotUp,
    PublishProblems,
    IgnoreUnknownUp,
    IgnoreStates,
    UniqueTag,
}

impl AggregatorConfigKey {
    pub const ALL: [AggregatorConfigKey; 9] = [
        AggregatorConfigKey::IncludeChildren,
        AggregatorConfigKey::IncludeMembers,
        AggregatorConfigKey::UpQuorum,
        AggregatorConfigKey::RunningQuorum,
        AggregatorConfigKey::PublishNotUp,
        AggregatorConfigKey::PublishProblems,
        AggregatorConfigKey::IgnoreUnknownUp,
        AggregatorConfigKey::IgnoreStates,
        AggregatorConfigKey::UniqueTag,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AggregatorConfigKey::IncludeChildren => "enricher.aggregating.from_children",
            AggregatorConfigKey::IncludeMembers => "enricher.aggregating.from_members",
            AggregatorConfigKey::UpQuorum => "enricher.service_state.children_and_members.quorum.up",
            AggregatorConfigKey::RunningQuorum => {
                "enricher.service_state.children_and_members.quorum.running"
            }
            AggregatorConfigKey::PublishNotUp => {
                "enricher.service_state.children_and_members.service_up.publish"
            }
            AggregatorConfigKey::PublishProblems => {
                "enricher.service_state.children_and_members.service_problems.publish"
            }
            AggregatorConfigKey::IgnoreUnknownUp => {
                "enricher.service_state.children_and_members.ignore_entities.service_up_null"
            }
            AggregatorConfigKey::IgnoreStates => {
                "enricher.service_state.children_and_members.ignore_entities.service_state_values"
            }
            AggregatorConfigKey::UniqueTag => "enricher.unique_tag",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AggregatorConfigKey::IncludeChildren => "Whether to aggregate the entity's children",
            AggregatorConfigKey::IncludeMembers => {
                "Whether to aggregate the group's members (default: iff the entity is a group)"
            }
            AggregatorConfigKey::UpQuorum => {
                "How many entities must be up for the parent to be up (default atLeastOneUnlessEmpty)"
            }
            AggregatorConfigKey::RunningQuorum => {
                "How many entities must be running for the parent to be healthy (default all)"
            }
            AggregatorConfigKey::PublishNotUp => "Whether to derive a not-up indicator entry",
            AggregatorConfigKey::PublishProblems => "Whether to derive a problems indicator entry",
            AggregatorConfigKey::IgnoreUnknownUp => {
                "Whether entities not publishing service up are left out of the up tally"
            }
            AggregatorConfigKey::IgnoreStates => {
                "Actual states (null = none published) that never count against the parent"
            }
            AggregatorConfigKey::UniqueTag => "Indicator key and enricher tag of this aggregator",
        }
    }

    /// Whether the option may change after the aggregator is attached
    pub fn is_reconfigurable(&self) -> bool {
        !matches!(
            self,
            AggregatorConfigKey::IncludeChildren
                | AggregatorConfigKey::IncludeMembers
                | AggregatorConfigKey::UniqueTag
        )
    }
}

impl fmt::Display for AggregatorConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregatorConfigKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        AggregatorConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| StateError::UnknownOption(s.to_string()))
    }
}

// ============================================================================
// Typed option values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorOption {
    IncludeChildren(bool),
    IncludeMembers(bool),
    UpQuorum(QuorumPolicy),
    RunningQuorum(QuorumPolicy),
    PublishNotUp(bool),
    PublishProblems(bool),
    IgnoreUnknownUp(bool),
    IgnoreStates(HashSet<Option<LifecycleState>>),
    UniqueTag(String),
}

impl AggregatorOption {
    pub fn key(&self) -> AggregatorConfigKey {
        match self {
            AggregatorOption::IncludeChildren(_) => AggregatorConfigKey::IncludeChildren,
            AggregatorOption::IncludeMembers(_) => AggregatorConfigKey::IncludeMembers,
            AggregatorOption::UpQuorum(_) => AggregatorConfigKey::UpQuorum,
            AggregatorOption::RunningQuorum(_) => AggregatorConfigKey::RunningQuorum,
            AggregatorOption::PublishNotUp(_) => AggregatorConfigKey::PublishNotUp,
            AggregatorOption::PublishProblems(_) => AggregatorConfigKey::PublishProblems,
            AggregatorOption::IgnoreUnknownUp(_) => AggregatorConfigKey::IgnoreUnknownUp,
            AggregatorOption::IgnoreStates(_) => AggregatorConfigKey::IgnoreStates,
            AggregatorOption::UniqueTag(_) => AggregatorConfigKey::UniqueTag,
        }
    }

    /// Decode the JSON value of a named option
    pub fn parse(name: &str, value: &Value, quorum_parser: &QuorumParser) -> Result<Self> {
        let key: AggregatorConfigKey = name.parse()?;
        let option = match key {
            AggregatorConfigKey::IncludeChildren => AggregatorOption::IncludeChildren(as_bool(key, value)?),
            AggregatorConfigKey::IncludeMembers => AggregatorOption::IncludeMembers(as_bool(key, value)?),
            AggregatorConfigKey::UpQuorum => AggregatorOption::UpQuorum(quorum_parser(as_str(key, value)?)?),
            AggregatorConfigKey::RunningQuorum => {
                AggregatorOption::RunningQuorum(quorum_parser(as_str(key, value)?)?)
            }
            AggregatorConfigKey::PublishNotUp => AggregatorOption::PublishNotUp(as_bool(key, value)?),
            AggregatorConfigKey::PublishProblems => AggregatorOption::PublishProblems(as_bool(key, value)?),
            AggregatorConfigKey::IgnoreUnknownUp => AggregatorOption::IgnoreUnknownUp(as_bool(key, value)?),
            AggregatorConfigKey::IgnoreStates => AggregatorOption::IgnoreStates(as_state_set(key, value)?),
            AggregatorConfigKey::UniqueTag => AggregatorOption::UniqueTag(as_str(key, value)?.to_string()),
        };
        Ok(option)
    }
}

fn invalid(key: AggregatorConfigKey, expected: &str, value: &Value) -> StateError {
    StateError::InvalidConfiguration(format!("{} expects {}, got {}", key, expected, value))
}

fn as_bool(key: AggregatorConfigKey, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| invalid(key, "a boolean", value))
}

fn as_str(key: AggregatorConfigKey, value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| invalid(key, "a string", value))
}

// Config input is decoded strictly: a typo must not silently ignore on-fire
// entities.
fn as_state_set(key: AggregatorConfigKey, value: &Value) -> Result<HashSet<Option<LifecycleState>>> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid(key, "a list of states", value))?;

    items
        .iter()
        .map(|item| match item {
            Value::Null => Ok(None),
            Value::String(s) => LifecycleState::try_parse(s)
                .map(Some)
                .ok_or_else(|| invalid(key, "lifecycle state names", item)),
            other => Err(invalid(key, "lifecycle state names", other)),
        })
        .collect()
}

// ============================================================================
// Aggregator configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ChildAggregatorConfig {
    pub unique_tag: String,
    pub include_children: bool,
    /// `None` = members iff the entity is a group
    pub include_members: Option<bool>,
    pub up_quorum: QuorumPolicy,
    pub running_quorum: QuorumPolicy,
    pub publish_not_up: bool,
    pub publish_problems: bool,
    pub ignore_unknown_up: bool,
    pub ignore_states: HashSet<Option<LifecycleState>>,
}

impl Default for ChildAggregatorConfig {
    fn default() -> Self {
        Self {
            unique_tag: DEFAULT_AGGREGATOR_TAG.to_string(),
            include_children: true,
            include_members: None,
            up_quorum: QuorumPolicy::AtLeastOneUnlessEmpty,
            running_quorum: QuorumPolicy::All,
            publish_not_up: true,
            publish_problems: true,
            ignore_unknown_up: true,
            ignore_states: default_ignore_states(),
        }
    }
}

impl ChildAggregatorConfig {
    /// Both summaries over children (and members, for groups)
    pub fn from_children() -> Self {
        Self::default()
    }

    /// Only the not-up summary, over children only
    pub fn from_children_up() -> Self {
        Self::default()
            .children_only()
            .problems(false)
            .unique_tag(DEFAULT_AGGREGATOR_UP_TAG)
    }

    /// Only the problems summary
    pub fn from_children_state() -> Self {
        Self::default().not_up(false)
    }

    /// Build from a map of named options; unknown keys are rejected
    pub fn from_options(options: &Map<String, Value>, quorum_parser: &QuorumParser) -> Result<Self> {
        let mut config = Self::default();
        for (name, value) in options {
            config.apply(AggregatorOption::parse(name, value, quorum_parser)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, option: AggregatorOption) {
        match option {
            AggregatorOption::IncludeChildren(v) => self.include_children = v,
            AggregatorOption::IncludeMembers(v) => self.include_members = Some(v),
            AggregatorOption::UpQuorum(q) => self.up_quorum = q,
            AggregatorOption::RunningQuorum(q) => self.running_quorum = q,
            AggregatorOption::PublishNotUp(v) => self.publish_not_up = v,
            AggregatorOption::PublishProblems(v) => self.publish_problems = v,
            AggregatorOption::IgnoreUnknownUp(v) => self.ignore_unknown_up = v,
            AggregatorOption::IgnoreStates(states) => self.ignore_states = states,
            AggregatorOption::UniqueTag(tag) => self.unique_tag = tag,
        }
    }

    pub fn unique_tag(mut self, tag: &str) -> Self {
        self.unique_tag = tag.to_string();
        self
    }

    pub fn children_only(mut self) -> Self {
        self.include_children = true;
        self.include_members = Some(false);
        self
    }

    pub fn members_only(mut self) -> Self {
        self.include_children = false;
        self.include_members = Some(true);
        self
    }

    pub fn include_members(mut self, include: bool) -> Self {
        self.include_members = Some(include);
        self
    }

    pub fn up_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.up_quorum = quorum;
        self
    }

    pub fn running_quorum(mut self, quorum: QuorumPolicy) -> Self {
        self.running_quorum = quorum;
        self
    }

    pub fn not_up(mut self, publish: bool) -> Self {
        self.publish_not_up = publish;
        self
    }

    pub fn problems(mut self, publish: bool) -> Self {
        self.publish_problems = publish;
        self
    }

    pub fn ignore_unknown_up(mut self, ignore: bool) -> Self {
        self.ignore_unknown_up = ignore;
        self
    }

    pub fn ignore_states<I>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = Option<LifecycleState>>,
    {
        self.ignore_states = states.into_iter().collect();
        self
    }

    /// Checks that don't depend on the entity the aggregator is attached to
    pub fn validate(&self) -> Result<()> {
        if self.unique_tag.trim().is_empty() {
            return Err(StateError::InvalidConfiguration(
                "aggregator unique tag must not be empty".to_string(),
            ));
        }
        if !self.include_children && self.include_members == Some(false) {
            return Err(StateError::InvalidConfiguration(
                "aggregator must include children or members".to_string(),
            ));
        }
        Ok(())
    }

    /// Decide member inclusion for an entity, rejecting members on non-groups
    pub fn resolve_include_members(&self, is_group: bool, entity: &str) -> Result<bool> {
        let include_members = match self.include_members {
            Some(true) if !is_group => {
                return Err(StateError::InvalidConfiguration(format!(
                    "'{}' does not support members",
                    entity
                )));
            }
            Some(include) => include,
            None => is_group,
        };
        if !self.include_children && !include_members {
            return Err(StateError::InvalidConfiguration(format!(
                "aggregator on '{}' has nothing to aggregate",
                entity
            )));
        }
        Ok(include_members)
    }
}

// ============================================================================
// Expected-state guard
// ============================================================================

/// Bounded wait for service-up before `expected = RUNNING` is published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedStateConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for ExpectedStateConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(200),
        }
    }
}

impl ExpectedStateConfig {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Skip the wait entirely
    pub fn no_wait() -> Self {
        Self::default().max_wait(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(StateError::InvalidConfiguration(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.poll_interval > self.max_wait && !self.max_wait.is_zero() {
            return Err(StateError::InvalidConfiguration(format!(
                "poll interval {:?} exceeds max wait {:?}",
                self.poll_interval, self.max_wait
            )));
        }
        Ok(())
    }

    /// This config when valid; otherwise the same bound polled at the
    /// default interval, capped by `max_wait`
    pub fn or_default_interval(&self) -> Self {
        if self.validate().is_ok() {
            return *self;
        }
        let interval = Self::default().poll_interval;
        let interval = if self.max_wait.is_zero() {
            interval
        } else {
            interval.min(self.max_wait)
        };
        Self {
            poll_interval: interval,
            ..*self
        }
    }
}
