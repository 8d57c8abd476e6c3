// ============================================================================
// Child / Member Aggregation
// ============================================================================
//
// Summarizes the health of an entity's roster (children and/or members) into
// one entry of the entity's not-up map and one entry of its problems map,
// both keyed by the aggregator's unique tag. Every evaluation re-reads the
// whole roster, so a missed or reordered event heals on the next one.
//
// ============================================================================

use super::config::{AggregatorConfigKey, AggregatorOption, ChildAggregatorConfig, QuorumParser};
use super::quorum::QuorumCheck;
use super::{Reevaluation, clear_map_sensor_entry, update_map_sensor_entry};
use crate::core::{IndicatorUpdate, LifecycleState, Result, StateError};
use crate::entity::{
    Enricher, Entity, Sensor, SensorEvent, SensorEventListener, SubscriptionTarget, WeakEntity,
    read_lock, write_lock,
};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Health snapshot of one roster entity
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub name: String,
    pub service_up: Option<bool>,
    pub actual: Option<LifecycleState>,
}

impl RosterEntry {
    pub fn new(name: &str, service_up: Option<bool>, actual: Option<LifecycleState>) -> Self {
        Self {
            name: name.to_string(),
            service_up,
            actual,
        }
    }

    fn of(entity: &Entity) -> Self {
        Self::new(entity.name(), entity.service_up(), entity.service_state_actual())
    }
}

impl fmt::Display for RosterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Not-up summary for a roster, or `None` when the up quorum is met
pub fn compute_not_up(roster: &[RosterEntry], config: &ChildAggregatorConfig) -> Option<String> {
    let mut considered = 0;
    let mut num_up = 0;
    let mut violators = Vec::new();

    for entry in roster {
        if config.ignore_unknown_up && entry.service_up.is_none() {
            continue;
        }
        considered += 1;
        if entry.service_up == Some(true) {
            num_up += 1;
        } else if !config.ignore_states.contains(&entry.actual) {
            violators.push(entry);
        }
    }

    if config.up_quorum.is_quorate(num_up, num_up + violators.len()) {
        return None;
    }

    let summary = if roster.is_empty() {
        "No entities present".to_string()
    } else if considered == 0 {
        "No entities publishing service up".to_string()
    } else if violators.is_empty() {
        "Not enough entities".to_string()
    } else if violators.len() == 1 {
        format!("{} is not up", violators[0])
    } else if violators.len() == considered {
        "None of the entities are up".to_string()
    } else {
        format!(
            "{} entities are not up, including {}",
            violators.len(),
            violators[0]
        )
    };
    Some(summary)
}

/// Problems summary for a roster, or `None` when the running quorum is met
pub fn compute_problems(roster: &[RosterEntry], config: &ChildAggregatorConfig) -> Option<String> {
    let mut num_running = 0;
    let mut not_healthy = Vec::new();

    for entry in roster {
        if entry.actual == Some(LifecycleState::Running) {
            num_running += 1;
        } else if !config.ignore_states.contains(&entry.actual) {
            not_healthy.push(entry);
        }
    }

    if config
        .running_quorum
        .is_quorate(num_running, num_running + not_healthy.len())
    {
        return None;
    }

    if not_healthy.is_empty() {
        return Some("Not enough entities running to be quorate".to_string());
    }

    let noun = if not_healthy.len() == 1 { "entity" } else { "entities" };
    let names = if not_healthy.len() > 3 {
        format!("{} and {} others", not_healthy[0], not_healthy.len() - 1)
    } else {
        not_healthy
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    Some(format!("Required {} not healthy: {}", noun, names))
}

/// Enricher deriving the roster summaries of one entity
pub struct ChildAggregator {
    unique_tag: String,
    config: RwLock<ChildAggregatorConfig>,
    entity: RwLock<Option<WeakEntity>>,
    evaluation: Reevaluation,
}

impl ChildAggregator {
    pub fn new(config: ChildAggregatorConfig) -> Self {
        Self {
            unique_tag: config.unique_tag.clone(),
            config: RwLock::new(config),
            entity: RwLock::new(None),
            evaluation: Reevaluation::new(),
        }
    }

    /// Create with `config` and attach to `entity`
    pub fn attach(entity: &Entity, config: ChildAggregatorConfig) -> Result<Arc<Self>> {
        let aggregator = Arc::new(Self::new(config));
        entity.add_enricher(aggregator.clone())?;
        Ok(aggregator)
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ChildAggregatorConfig {
        read_lock(&self.config).clone()
    }

    pub fn is_attached(&self) -> bool {
        read_lock(&self.entity).is_some()
    }

    /// Change one option; takes effect immediately.
    ///
    /// Roster inclusion is fixed once attached and the unique tag at
    /// construction. Turning a summary off removes the entry it had published.
    pub fn reconfigure(&self, option: AggregatorOption) -> Result<()> {
        let key = option.key();
        if key == AggregatorConfigKey::UniqueTag {
            return Err(StateError::InvalidConfiguration(format!(
                "{} is fixed at construction",
                key
            )));
        }
        if !key.is_reconfigurable() && self.is_attached() {
            return Err(StateError::InvalidConfiguration(format!(
                "{} is fixed once the aggregator is attached",
                key
            )));
        }

        let (retract_not_up, retract_problems) = {
            let mut config = write_lock(&self.config);
            let mut next = config.clone();
            next.apply(option);
            next.validate()?;
            let retract = (
                config.publish_not_up && !next.publish_not_up,
                config.publish_problems && !next.publish_problems,
            );
            *config = next;
            retract
        };

        if let Some(entity) = self.entity().filter(|e| e.is_managed()) {
            if retract_not_up {
                clear_map_sensor_entry(&entity, Sensor::ServiceNotUpIndicators, &self.unique_tag);
            }
            if retract_problems {
                clear_map_sensor_entry(&entity, Sensor::ServiceProblems, &self.unique_tag);
            }
        }
        debug!(tag = %self.unique_tag, option = %key, "reconfigured aggregator");
        self.recompute();
        Ok(())
    }

    /// Reconfigure from a named option and its JSON value
    pub fn reconfigure_named(&self, name: &str, value: &Value, quorum_parser: &QuorumParser) -> Result<()> {
        self.reconfigure(AggregatorOption::parse(name, value, quorum_parser)?)
    }

    fn entity(&self) -> Option<Entity> {
        read_lock(&self.entity).as_ref().and_then(|e| e.upgrade())
    }

    /// Current roster, children first, each entity once
    fn roster(&self, entity: &Entity, config: &ChildAggregatorConfig) -> Vec<RosterEntry> {
        let mut seen = HashSet::new();
        let mut roster = Vec::new();

        let children = if config.include_children {
            entity.children()
        } else {
            Vec::new()
        };
        let members = if config.include_members == Some(true) {
            entity.members()
        } else {
            Vec::new()
        };

        for candidate in children.into_iter().chain(members) {
            if candidate.is_managed() && seen.insert(candidate.id()) {
                roster.push(RosterEntry::of(&candidate));
            }
        }
        roster
    }

    fn evaluate(&self) {
        let Some(entity) = self.entity() else {
            return;
        };
        if !entity.is_managed() {
            debug!(entity = %entity, tag = %self.unique_tag, "skipping aggregation, entity no longer managed");
            return;
        }

        let config = self.config();
        let roster = self.roster(&entity, &config);

        if config.publish_problems {
            let summary = compute_problems(&roster, &config);
            self.publish(&entity, Sensor::ServiceProblems, summary);
        }
        if config.publish_not_up {
            let summary = compute_not_up(&roster, &config);
            self.publish(&entity, Sensor::ServiceNotUpIndicators, summary);
        }
    }

    fn publish(&self, entity: &Entity, sensor: Sensor, summary: Option<String>) {
        trace!(entity = %entity, sensor = %sensor, summary = ?summary, "roster summary");
        let update = match summary {
            Some(text) => IndicatorUpdate::Set(Value::String(text)),
            None => IndicatorUpdate::Remove,
        };
        update_map_sensor_entry(entity, sensor, &self.unique_tag, update);
    }
}

impl SensorEventListener for ChildAggregator {
    fn on_event(&self, _event: &SensorEvent) {
        self.recompute();
    }
}

impl Enricher for ChildAggregator {
    fn unique_tag(&self) -> String {
        self.unique_tag.clone()
    }

    fn set_entity(self: Arc<Self>, entity: &Entity) -> Result<()> {
        let (include_children, include_members) = {
            let mut config = write_lock(&self.config);
            config.validate()?;
            let include_members = config.resolve_include_members(entity.is_group(), entity.name())?;
            config.include_members = Some(include_members);
            (config.include_children, include_members)
        };
        *write_lock(&self.entity) = Some(entity.downgrade());

        let subscriptions = entity.subscriptions();
        let watch = |target: SubscriptionTarget, sensor: Sensor| {
            subscriptions
                .subscribe(entity.id(), &self.unique_tag, target, sensor, self.clone())
        };

        if include_children {
            watch(SubscriptionTarget::ChildrenOf(entity.id()), Sensor::ServiceUp)?;
            watch(SubscriptionTarget::ChildrenOf(entity.id()), Sensor::ServiceStateActual)?;
            watch(SubscriptionTarget::Entity(entity.id()), Sensor::ChildAdded)?;
            watch(SubscriptionTarget::Entity(entity.id()), Sensor::ChildRemoved)?;
        }
        if include_members {
            watch(SubscriptionTarget::MembersOf(entity.id()), Sensor::ServiceUp)?;
            watch(SubscriptionTarget::MembersOf(entity.id()), Sensor::ServiceStateActual)?;
            watch(SubscriptionTarget::Entity(entity.id()), Sensor::MemberAdded)?;
            watch(SubscriptionTarget::Entity(entity.id()), Sensor::MemberRemoved)?;
        }

        debug!(
            entity = %entity,
            tag = %self.unique_tag,
            include_children,
            include_members,
            "attached roster aggregator"
        );
        self.recompute();
        Ok(())
    }

    fn recompute(&self) {
        self.evaluation.run(|| self.evaluate());
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::quorum::QuorumPolicy;
    use crate::core::LifecycleState::*;

    fn entry(name: &str, up: Option<bool>, actual: Option<LifecycleState>) -> RosterEntry {
        RosterEntry::new(name, up, actual)
    }

    #[test]
    fn test_not_up_tiers() {
        let config = ChildAggregatorConfig::default().up_quorum(QuorumPolicy::AllAndAtLeastOne);

        assert_eq!(compute_not_up(&[], &config).as_deref(), Some("No entities present"));
        assert_eq!(
            compute_not_up(&[entry("a", None, None)], &config).as_deref(),
            Some("No entities publishing service up")
        );
        assert_eq!(
            compute_not_up(&[entry("a", Some(false), Some(OnFire))], &config).as_deref(),
            Some("a is not up")
        );
        assert_eq!(
            compute_not_up(
                &[entry("a", Some(false), Some(OnFire)), entry("b", Some(false), Some(Running))],
                &config
            )
            .as_deref(),
            Some("None of the entities are up")
        );
        assert_eq!(
            compute_not_up(
                &[
                    entry("a", Some(true), Some(Running)),
                    entry("b", Some(false), Some(OnFire)),
                    entry("c", Some(false), Some(OnFire)),
                ],
                &config
            )
            .as_deref(),
            Some("2 entities are not up, including b")
        );
    }

    #[test]
    fn test_not_enough_entities() {
        let config = ChildAggregatorConfig::default().up_quorum(QuorumPolicy::AtLeast(2));
        assert_eq!(
            compute_not_up(&[entry("a", Some(true), Some(Running))], &config).as_deref(),
            Some("Not enough entities")
        );
    }

    #[test]
    fn test_not_up_ignores_states() {
        let config = ChildAggregatorConfig::default().up_quorum(QuorumPolicy::All);
        // down but stopped: not a violator
        let roster = [
            entry("a", Some(true), Some(Running)),
            entry("b", Some(false), Some(Stopped)),
        ];
        assert_eq!(compute_not_up(&roster, &config), None);
    }

    #[test]
    fn test_unknown_up_counted_when_not_ignored() {
        let config = ChildAggregatorConfig::default()
            .up_quorum(QuorumPolicy::All)
            .ignore_unknown_up(false)
            .ignore_states(Vec::new());
        let roster = [entry("a", Some(true), Some(Running)), entry("b", None, None)];
        assert_eq!(compute_not_up(&roster, &config).as_deref(), Some("b is not up"));
    }

    #[test]
    fn test_default_up_quorum_is_lenient_when_empty() {
        let config = ChildAggregatorConfig::default();
        assert_eq!(compute_not_up(&[], &config), None);
        assert_eq!(compute_not_up(&[entry("a", None, None)], &config), None);
    }

    #[test]
    fn test_problems() {
        let config = ChildAggregatorConfig::default();
        assert_eq!(compute_problems(&[], &config), None);
        assert_eq!(
            compute_problems(&[entry("a", Some(true), Some(Running))], &config),
            None
        );
        assert_eq!(
            compute_problems(&[entry("a", Some(false), Some(OnFire))], &config).as_deref(),
            Some("Required entity not healthy: a")
        );
        assert_eq!(
            compute_problems(
                &[
                    entry("a", None, Some(OnFire)),
                    entry("b", None, Some(OnFire)),
                    entry("c", None, Some(Stopped)),
                ],
                &config
            )
            .as_deref(),
            Some("Required entities not healthy: a, b")
        );
    }

    #[test]
    fn test_problems_truncates_long_lists() {
        let config = ChildAggregatorConfig::default();
        let roster: Vec<RosterEntry> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|name| entry(name, Some(false), Some(OnFire)))
            .collect();
        assert_eq!(
            compute_problems(&roster, &config).as_deref(),
            Some("Required entities not healthy: a and 4 others")
        );
    }

    #[test]
    fn test_problems_quorum_without_unhealthy() {
        let config = ChildAggregatorConfig::default().running_quorum(QuorumPolicy::AllAndAtLeastOne);
        assert_eq!(
            compute_problems(&[], &config).as_deref(),
            Some("Not enough entities running to be quorate")
        );
        assert_eq!(
            compute_problems(&[entry("a", Some(false), Some(Stopped))], &config).as_deref(),
            Some("Not enough entities running to be quorate")
        );
    }
}
