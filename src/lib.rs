// ============================================================================
// Service State Library
// ============================================================================
//
// Derives the health of managed entities from three kinds of input:
// - keyed not-up and problem indicators published by independent writers
// - the expected lifecycle transition declared by the operator
// - the health of an entity's children and group members
//
// ============================================================================

//! Service-state aggregation for managed entity trees.
//!
//! # Examples
//!
//! ```
//! use servicestate::{LifecycleState, ManagementContext, attach_default_enrichers,
//!     attach_default_group_enrichers, clear_not_up_indicator, clear_problems_indicator,
//!     update_not_up_indicator, update_problems_indicator};
//!
//! # fn main() -> servicestate::Result<()> {
//! let ctx = ManagementContext::new();
//! let app = ctx.create_entity("app");
//! attach_default_group_enrichers(&app)?;
//!
//! let web = ctx.create_child(&app, "web")?;
//! attach_default_enrichers(&web)?;
//!
//! // web has not published a state yet, so the app ignores it
//! update_not_up_indicator(&web, "process", "not started");
//! assert_eq!(web.service_up(), Some(false));
//! assert_eq!(app.service_up(), Some(true));
//!
//! update_problems_indicator(&web, "disk", "full");
//! assert_eq!(web.service_state_actual(), Some(LifecycleState::Stopped));
//!
//! clear_not_up_indicator(&web, "process");
//! assert_eq!(web.service_state_actual(), Some(LifecycleState::OnFire));
//! assert_eq!(app.service_state_actual(), Some(LifecycleState::OnFire));
//!
//! clear_problems_indicator(&web, "disk");
//! assert_eq!(web.service_state_actual(), Some(LifecycleState::Running));
//! assert_eq!(app.service_state_actual(), Some(LifecycleState::Running));
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod entity;
pub mod logic;
pub mod scenario;

pub use core::{IndicatorMap, IndicatorUpdate, LifecycleState, Result, StateError, Transition};

pub use entity::{
    Enricher, Entity, EntityId, ManagementContext, Sensor, SensorEvent, SensorEventListener,
    SensorValue, SubscriptionManager, SubscriptionTarget,
};

pub use logic::{
    ActualStateComputer, ActualStateVerdict, AggregatorConfigKey, AggregatorOption, ChildAggregator,
    ChildAggregatorConfig, ExpectedStateConfig, QuorumCheck, QuorumPolicy, RosterEntry,
    ServiceUpComputer, attach_default_enrichers, attach_default_group_enrichers,
    clear_not_up_indicator, clear_problems_indicator, compute_actual, compute_not_up,
    compute_problems, expected_state, is_expected_state, not_up_indicator, problems_indicator,
    set_expected_state, set_expected_state_with, update_not_up_indicator,
    update_not_up_indicator_requiring_non_empty, update_problems_indicator,
};

pub use scenario::{HealthSnapshot, Scenario, ScenarioReport, Step, StepReport};
