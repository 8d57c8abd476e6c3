// ============================================================================
// Actual State
// ============================================================================
//
// Derives `service.state` from three inputs: the problems map, `serviceUp`
// and the expected transition.
//
//   expected RUNNING        -> RUNNING if up and no problems, else ON_FIRE
//   expected other state    -> that state, inputs ignored
//   no expectation:
//     problems non-empty    -> STOPPED if explicitly down, else ON_FIRE
//     problems empty        -> from serviceUp (unknown clears the sensor)
//     problems absent       -> leave the sensor alone
//
// ============================================================================

use super::Reevaluation;
use crate::core::{IndicatorMap, LifecycleState, Result, Transition};
use crate::entity::{
    Enricher, Entity, Sensor, SensorEvent, SensorEventListener, SensorValue, SubscriptionTarget,
    WeakEntity, read_lock, write_lock,
};
use std::any::Any;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

pub const DEFAULT_ACTUAL_STATE_TAG: &str = "service.state.actual";

/// Outcome of one actual-state evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualStateVerdict {
    Set(LifecycleState),
    /// Remove the sensor: the state is unknown
    Clear,
    /// Keep whatever is there, it may have been set by hand
    Unchanged,
}

pub fn compute_actual(
    problems: Option<&IndicatorMap>,
    service_up: Option<bool>,
    expected: Option<&Transition>,
) -> ActualStateVerdict {
    let has_problems = problems.map(|p| !p.is_empty()).unwrap_or(false);

    if let Some(expected) = expected {
        if expected.state() == LifecycleState::Running {
            return if service_up == Some(true) && !has_problems {
                ActualStateVerdict::Set(LifecycleState::Running)
            } else {
                ActualStateVerdict::Set(LifecycleState::OnFire)
            };
        }
        return ActualStateVerdict::Set(expected.state());
    }

    match problems {
        Some(_) if has_problems => {
            if service_up == Some(false) {
                ActualStateVerdict::Set(LifecycleState::Stopped)
            } else {
                ActualStateVerdict::Set(LifecycleState::OnFire)
            }
        }
        Some(_) => match service_up {
            None => ActualStateVerdict::Clear,
            Some(true) => ActualStateVerdict::Set(LifecycleState::Running),
            Some(false) => ActualStateVerdict::Set(LifecycleState::Stopped),
        },
        None => ActualStateVerdict::Unchanged,
    }
}

/// Keeps `service.state` in line with [`compute_actual`]
pub struct ActualStateComputer {
    unique_tag: String,
    suppress_duplicates: bool,
    entity: RwLock<Option<WeakEntity>>,
    evaluation: Reevaluation,
}

impl ActualStateComputer {
    pub fn new() -> Self {
        Self {
            unique_tag: DEFAULT_ACTUAL_STATE_TAG.to_string(),
            suppress_duplicates: true,
            entity: RwLock::new(None),
            evaluation: Reevaluation::new(),
        }
    }

    pub fn with_unique_tag(mut self, tag: &str) -> Self {
        self.unique_tag = tag.to_string();
        self
    }

    /// Publish every evaluation, even when the state is unchanged
    pub fn always_publish(mut self) -> Self {
        self.suppress_duplicates = false;
        self
    }

    pub fn attach(entity: &Entity) -> Result<Arc<Self>> {
        let computer = Arc::new(Self::new());
        entity.add_enricher(computer.clone())?;
        Ok(computer)
    }

    fn entity(&self) -> Option<Entity> {
        read_lock(&self.entity).as_ref().and_then(|e| e.upgrade())
    }

    fn evaluate(&self) {
        let Some(entity) = self.entity() else {
            return;
        };
        if !entity.is_managed() {
            debug!(entity = %entity, "skipping actual state recompute, entity no longer managed");
            return;
        }

        let problems = entity.service_problems();
        let service_up = entity.service_up();
        let expected = entity.service_state_expected();
        let verdict = compute_actual(problems.as_ref(), service_up, expected.as_ref());

        if verdict == ActualStateVerdict::Set(LifecycleState::OnFire)
            && entity.service_state_actual() != Some(LifecycleState::OnFire)
        {
            let not_up = entity.not_up_indicators().unwrap_or_default();
            warn!(
                entity = %entity,
                problems = %problems.unwrap_or_default(),
                not_up = %not_up,
                service_up = ?service_up,
                expected = ?expected.map(|t| t.state()),
                "setting entity on fire"
            );
        }

        self.publish(&entity, verdict);
    }

    fn publish(&self, entity: &Entity, verdict: ActualStateVerdict) {
        match verdict {
            ActualStateVerdict::Unchanged => {}
            ActualStateVerdict::Clear => {
                if entity.remove_attribute(Sensor::ServiceStateActual).is_some() {
                    trace!(entity = %entity, "cleared actual state");
                }
            }
            ActualStateVerdict::Set(state) if self.suppress_duplicates => {
                let published = entity.modify(Sensor::ServiceStateActual, |current| {
                    if current.and_then(|v| v.as_state()) == Some(state) {
                        None
                    } else {
                        Some(SensorValue::State(state))
                    }
                });
                if published.is_some() {
                    trace!(entity = %entity, state = %state, "published actual state");
                }
            }
            ActualStateVerdict::Set(state) => {
                entity.set_attribute(Sensor::ServiceStateActual, SensorValue::State(state));
                trace!(entity = %entity, state = %state, "published actual state");
            }
        }
    }
}

impl Default for ActualStateComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorEventListener for ActualStateComputer {
    fn on_event(&self, _event: &SensorEvent) {
        self.recompute();
    }
}

impl Enricher for ActualStateComputer {
    fn unique_tag(&self) -> String {
        self.unique_tag.clone()
    }

    fn set_entity(self: Arc<Self>, entity: &Entity) -> Result<()> {
        *write_lock(&self.entity) = Some(entity.downgrade());
        for sensor in [
            Sensor::ServiceProblems,
            Sensor::ServiceUp,
            Sensor::ServiceStateExpected,
        ] {
            entity.subscriptions().subscribe(
                entity.id(),
                &self.unique_tag,
                SubscriptionTarget::Entity(entity.id()),
                sensor,
                self.clone(),
            )?;
        }
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
    use crate::entity::ManagementContext;
    use crate::core::LifecycleState::*;

    fn expect(state: LifecycleState) -> Transition {
        Transition::new(state, 0)
    }

    #[test]
    fn test_expected_running() {
        let clean = IndicatorMap::new();
        let dirty = IndicatorMap::new().with("disk", "full");
        let running = expect(Running);

        assert_eq!(compute_actual(None, Some(true), Some(&running)), ActualStateVerdict::Set(Running));
        assert_eq!(compute_actual(Some(&clean), Some(true), Some(&running)), ActualStateVerdict::Set(Running));
        assert_eq!(compute_actual(Some(&dirty), Some(true), Some(&running)), ActualStateVerdict::Set(OnFire));
        assert_eq!(compute_actual(None, None, Some(&running)), ActualStateVerdict::Set(OnFire));
        assert_eq!(compute_actual(None, Some(false), Some(&running)), ActualStateVerdict::Set(OnFire));
    }

    #[test]
    fn test_expected_other_state_wins() {
        let dirty = IndicatorMap::new().with("disk", "full");
        for state in [Created, Starting, Stopping, Stopped, Destroyed, OnFire] {
            assert_eq!(
                compute_actual(Some(&dirty), Some(false), Some(&expect(state))),
                ActualStateVerdict::Set(state)
            );
        }
    }

    #[test]
    fn test_no_expectation() {
        let clean = IndicatorMap::new();
        let dirty = IndicatorMap::new().with("disk", "full");

        assert_eq!(compute_actual(Some(&dirty), Some(false), None), ActualStateVerdict::Set(Stopped));
        assert_eq!(compute_actual(Some(&dirty), Some(true), None), ActualStateVerdict::Set(OnFire));
        assert_eq!(compute_actual(Some(&dirty), None, None), ActualStateVerdict::Set(OnFire));

        assert_eq!(compute_actual(Some(&clean), Some(true), None), ActualStateVerdict::Set(Running));
        assert_eq!(compute_actual(Some(&clean), Some(false), None), ActualStateVerdict::Set(Stopped));
        assert_eq!(compute_actual(Some(&clean), None, None), ActualStateVerdict::Clear);

        assert_eq!(compute_actual(None, Some(true), None), ActualStateVerdict::Unchanged);
        assert_eq!(compute_actual(None, None, None), ActualStateVerdict::Unchanged);
    }

    #[test]
    fn test_absent_problems_keep_manual_state() {
        let ctx = ManagementContext::new();
        let entity = ctx.create_entity("db");
        entity.set_attribute(Sensor::ServiceStateActual, SensorValue::State(Starting));

        ActualStateComputer::attach(&entity).unwrap();
        entity.set_attribute(Sensor::ServiceUp, SensorValue::Bool(true));

        assert_eq!(entity.service_state_actual(), Some(Starting));
    }

    #[test]
    fn test_clean_problems_with_unknown_up_clears() {
        let ctx = ManagementContext::new();
        let entity = ctx.create_entity("db");
        entity.set_attribute(Sensor::ServiceStateActual, SensorValue::State(Running));
        ActualStateComputer::attach(&entity).unwrap();

        entity.set_attribute(Sensor::ServiceProblems, SensorValue::Indicators(IndicatorMap::new()));

        assert_eq!(entity.attribute(Sensor::ServiceStateActual), None);
    }

    #[test]
    fn test_no_write_after_unmanage() {
        let ctx = ManagementContext::new();
        let entity = ctx.create_entity("db");
        let computer = ActualStateComputer::attach(&entity).unwrap();

        ctx.unmanage(&entity).unwrap();
        computer.recompute();

        assert_eq!(entity.attribute(Sensor::ServiceStateActual), None);
    }
}
