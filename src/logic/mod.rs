// ============================================================================
// Service State Logic
// ============================================================================
//
// The evaluators that turn raw indicator maps into `serviceUp` and
// `service.state`, plus the entity-level helpers every writer goes through:
//
//   not-up map  --ServiceUpComputer-->  serviceUp  --+
//   problems map ----------------------------------+--ActualStateComputer--> service.state
//   expected transition ---------------------------+
//
// A ChildAggregator on a parent feeds both maps of the parent from the
// serviceUp / service.state of its children and members.
//
// ============================================================================

pub mod actual_state;
pub mod children;
pub mod config;
pub mod quorum;
pub mod service_up;

pub use actual_state::{ActualStateComputer, ActualStateVerdict, compute_actual};
pub use children::{ChildAggregator, RosterEntry, compute_not_up, compute_problems};
pub use config::{
    AggregatorConfigKey, AggregatorOption, ChildAggregatorConfig, ExpectedStateConfig,
    default_quorum_parser,
};
pub use quorum::{QuorumCheck, QuorumPolicy};
pub use service_up::{ServiceUpComputer, compute_service_up};

use crate::core::{IndicatorUpdate, LifecycleState, Result, Transition, indicators};
use crate::entity::{Entity, Sensor, SensorValue};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

// ============================================================================
// Evaluation trigger
// ============================================================================

/// Serializes evaluations of one evaluator and coalesces overlapping requests.
///
/// A request arriving while an evaluation runs (from another thread, or from
/// the same call chain) only marks the evaluator dirty; the running caller
/// evaluates again before returning. No evaluation ever waits on a lock held
/// by its own call chain.
pub(crate) struct Reevaluation {
    requested: AtomicBool,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Reevaluation {
    pub(crate) fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn run(&self, evaluate: impl Fn()) {
        self.requested.store(true, Ordering::SeqCst);
        loop {
            if self.running.swap(true, Ordering::SeqCst) {
                return;
            }
            {
                let _guard = RunningGuard(&self.running);
                while self.requested.swap(false, Ordering::SeqCst) {
                    evaluate();
                }
            }
            // a request may have landed between the last check and the release
            if !self.requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

// ============================================================================
// Indicator map entries
// ============================================================================

/// Apply `update` to `key` of the map held in `sensor`.
///
/// Serialized per entity, so concurrent writers of different keys never lose
/// each other's entries. Returns whether a new map was published.
pub fn update_map_sensor_entry(entity: &Entity, sensor: Sensor, key: &str, update: IndicatorUpdate) -> bool {
    if entity.is_no_longer_managed() {
        debug!(entity = %entity, sensor = %sensor, key, "ignoring indicator write, entity no longer managed");
        return false;
    }
    let published = entity.modify(sensor, |current| {
        let current = current.and_then(|v| v.as_indicators());
        indicators::upsert(current, key, update).map(SensorValue::Indicators)
    });
    if let Some(map) = &published {
        trace!(entity = %entity, sensor = %sensor, map = %map, "published indicator map");
    }
    published.is_some()
}

pub fn clear_map_sensor_entry(entity: &Entity, sensor: Sensor, key: &str) -> bool {
    update_map_sensor_entry(entity, sensor, key, IndicatorUpdate::Remove)
}

pub fn map_sensor_entry(entity: &Entity, sensor: Sensor, key: &str) -> Option<Value> {
    entity
        .indicators(sensor)
        .and_then(|map| map.get(key).cloned())
}

pub fn update_not_up_indicator(entity: &Entity, key: &str, value: impl Into<Value>) -> bool {
    update_map_sensor_entry(
        entity,
        Sensor::ServiceNotUpIndicators,
        key,
        IndicatorUpdate::Set(value.into()),
    )
}

pub fn clear_not_up_indicator(entity: &Entity, key: &str) -> bool {
    clear_map_sensor_entry(entity, Sensor::ServiceNotUpIndicators, key)
}

pub fn not_up_indicator(entity: &Entity, key: &str) -> Option<Value> {
    map_sensor_entry(entity, Sensor::ServiceNotUpIndicators, key)
}

pub fn update_problems_indicator(entity: &Entity, key: &str, value: impl Into<Value>) -> bool {
    update_map_sensor_entry(
        entity,
        Sensor::ServiceProblems,
        key,
        IndicatorUpdate::Set(value.into()),
    )
}

pub fn clear_problems_indicator(entity: &Entity, key: &str) -> bool {
    clear_map_sensor_entry(entity, Sensor::ServiceProblems, key)
}

pub fn problems_indicator(entity: &Entity, key: &str) -> Option<Value> {
    map_sensor_entry(entity, Sensor::ServiceProblems, key)
}

/// Flag `key` as not-up while a watched collection has no entries
pub fn update_not_up_indicator_requiring_non_empty(entity: &Entity, key: &str, len: usize) -> bool {
    if len == 0 {
        update_not_up_indicator(entity, key, "Should have at least one entry")
    } else {
        clear_not_up_indicator(entity, key)
    }
}

// ============================================================================
// Expected state
// ============================================================================

/// Declare the state the entity is meant to be in, with the default bounded wait
pub async fn set_expected_state(entity: &Entity, state: LifecycleState) {
    set_expected_state_with(entity, state, &ExpectedStateConfig::default()).await
}

/// Declare the expected state.
///
/// For `Running`, first waits up to `config.max_wait` for `serviceUp` so the
/// declaration does not overtake an up signal already on its way. The wait
/// never fails: on timeout the state is declared anyway. An invalid config
/// is logged and polled at the default interval instead.
pub async fn set_expected_state_with(entity: &Entity, state: LifecycleState, config: &ExpectedStateConfig) {
    if let Err(e) = config.validate() {
        warn!(
            entity = %entity,
            error = %e,
            "invalid expected-state config, using default poll interval"
        );
    }
    let config = config.or_default_interval();
    if state == LifecycleState::Running {
        wait_for_service_up(entity, &config).await;
    }
    if entity.is_no_longer_managed() {
        debug!(entity = %entity, state = %state, "ignoring expected state, entity no longer managed");
        return;
    }

    entity.set_attribute(
        Sensor::ServiceStateExpected,
        SensorValue::Transition(Transition::now(state)),
    );

    if let Some(computer) = entity.enricher(actual_state::DEFAULT_ACTUAL_STATE_TAG) {
        computer.recompute();
    }
}

async fn wait_for_service_up(entity: &Entity, config: &ExpectedStateConfig) {
    let initial = entity.service_up();
    if initial == Some(true) {
        return;
    }

    let started = Instant::now();
    let poll_interval = config.poll_interval;
    let poll = async {
        while entity.service_up() != Some(true) {
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(config.max_wait, poll).await {
        Ok(()) => debug!(
            entity = %entity,
            waited_ms = started.elapsed().as_millis() as u64,
            "service up before declaring running"
        ),
        Err(_) => warn!(
            entity = %entity,
            waited_ms = started.elapsed().as_millis() as u64,
            service_up = ?entity.service_up(),
            not_up = %entity.not_up_indicators().unwrap_or_default(),
            "service is not up when declaring running"
        ),
    }
}

pub fn expected_state(entity: &Entity) -> Option<LifecycleState> {
    entity.service_state_expected().map(|t| t.state())
}

pub fn is_expected_state(entity: &Entity, state: LifecycleState) -> bool {
    expected_state(entity) == Some(state)
}

// ============================================================================
// Standard stacks
// ============================================================================

/// Attach service-up and actual-state evaluators
pub fn attach_default_enrichers(entity: &Entity) -> Result<()> {
    entity.add_enricher(Arc::new(ServiceUpComputer::new()))?;
    entity.add_enricher(Arc::new(ActualStateComputer::new()))?;
    Ok(())
}

/// [`attach_default_enrichers`] plus a roster aggregator with default settings
pub fn attach_default_group_enrichers(entity: &Entity) -> Result<Arc<ChildAggregator>> {
    attach_default_enrichers(entity)?;
    ChildAggregator::attach(entity, ChildAggregatorConfig::from_children())
}
