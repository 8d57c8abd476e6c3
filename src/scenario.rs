// ============================================================================
// Scenarios
// ============================================================================
//
// A scenario declares an entity tree and a sequence of health events, and
// records the health of every entity after each event:
//
//   {
//     "entities": [
//       { "name": "app", "aggregate": {} },
//       { "name": "cluster", "parent": "app", "group": true, "aggregate": {} },
//       { "name": "node-1", "parent": "cluster", "members_of": ["cluster"] }
//     ],
//     "steps": [
//       { "op": "clear_not_up", "entity": "node-1", "key": "process" },
//       { "op": "expect", "entity": "node-1", "state": "running" }
//     ]
//   }
//
// Every entity gets the default service-up / actual-state evaluators; an
// `aggregate` object (possibly empty) adds a roster aggregator configured
// from the named options it contains.
//
// ============================================================================

use crate::core::{IndicatorMap, LifecycleState, Result, StateError};
use crate::entity::{Entity, ManagementContext, Sensor, SensorValue};
use crate::logic::config::DEFAULT_AGGREGATOR_TAG;
use crate::logic::{
    self, ChildAggregator, ChildAggregatorConfig, ExpectedStateConfig, default_quorum_parser,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Cap on the wait for service-up before `expect running`
    #[serde(default)]
    pub expect_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub group: bool,
    /// Groups this entity joins as a member
    #[serde(default)]
    pub members_of: Vec<String>,
    #[serde(default)]
    pub aggregate: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    NotUp {
        entity: String,
        key: String,
        value: Value,
    },
    ClearNotUp {
        entity: String,
        key: String,
    },
    Problem {
        entity: String,
        key: String,
        value: Value,
    },
    ClearProblem {
        entity: String,
        key: String,
    },
    Expect {
        entity: String,
        state: LifecycleState,
    },
    SetUp {
        entity: String,
        up: Option<bool>,
    },
    SetActual {
        entity: String,
        state: Option<LifecycleState>,
    },
    AddMember {
        group: String,
        member: String,
    },
    RemoveMember {
        group: String,
        member: String,
    },
    Unmanage {
        entity: String,
    },
    Reconfigure {
        entity: String,
        #[serde(default)]
        tag: Option<String>,
        options: Map<String, Value>,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::NotUp { entity, key, value } => write!(f, "{}: not-up {} = {}", entity, key, value),
            Step::ClearNotUp { entity, key } => write!(f, "{}: clear not-up {}", entity, key),
            Step::Problem { entity, key, value } => write!(f, "{}: problem {} = {}", entity, key, value),
            Step::ClearProblem { entity, key } => write!(f, "{}: clear problem {}", entity, key),
            Step::Expect { entity, state } => write!(f, "{}: expect {}", entity, state),
            Step::SetUp { entity, up } => match up {
                Some(up) => write!(f, "{}: service up = {}", entity, up),
                None => write!(f, "{}: service up cleared", entity),
            },
            Step::SetActual { entity, state } => match state {
                Some(state) => write!(f, "{}: actual = {}", entity, state),
                None => write!(f, "{}: actual cleared", entity),
            },
            Step::AddMember { group, member } => write!(f, "{}: add member {}", group, member),
            Step::RemoveMember { group, member } => write!(f, "{}: remove member {}", group, member),
            Step::Unmanage { entity } => write!(f, "{}: unmanage", entity),
            Step::Reconfigure { entity, options, .. } => {
                let keys: Vec<&str> = options.keys().map(String::as_str).collect();
                write!(f, "{}: reconfigure {}", entity, keys.join(", "))
            }
        }
    }
}

/// Health sensors of one entity at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub name: String,
    pub service_up: Option<bool>,
    pub expected: Option<LifecycleState>,
    pub actual: Option<LifecycleState>,
    pub not_up: Option<IndicatorMap>,
    pub problems: Option<IndicatorMap>,
}

impl HealthSnapshot {
    pub fn of(entity: &Entity) -> Self {
        Self {
            name: entity.name().to_string(),
            service_up: entity.service_up(),
            expected: logic::expected_state(entity),
            actual: entity.service_state_actual(),
            not_up: entity.not_up_indicators(),
            problems: entity.service_problems(),
        }
    }
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for HealthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} up={:<5} expected={:<9} actual={:<9} not-up={} problems={}",
            self.name,
            or_dash(&self.service_up),
            or_dash(&self.expected),
            or_dash(&self.actual),
            or_dash(&self.not_up),
            or_dash(&self.problems)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: usize,
    pub description: String,
    pub entities: Vec<HealthSnapshot>,
}

impl StepReport {
    pub fn entity(&self, name: &str) -> Option<&HealthSnapshot> {
        self.entities.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: Option<String>,
    pub initial: Vec<HealthSnapshot>,
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    /// Snapshots after the last step, or the initial ones if there were no steps
    pub fn last(&self) -> &[HealthSnapshot] {
        self.steps
            .last()
            .map(|s| s.entities.as_slice())
            .unwrap_or(&self.initial)
    }
}

impl Scenario {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StateError::Scenario(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    fn expected_state_config(&self) -> Result<ExpectedStateConfig> {
        let config = match self.expect_wait_ms {
            Some(0) => ExpectedStateConfig::no_wait(),
            Some(ms) => {
                let defaults = ExpectedStateConfig::default();
                let max_wait = Duration::from_millis(ms);
                defaults
                    .max_wait(max_wait)
                    .poll_interval(defaults.poll_interval.min(max_wait))
            }
            None => ExpectedStateConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the entity tree in a fresh management context
    pub fn build(&self) -> Result<ManagementContext> {
        let ctx = ManagementContext::new();

        for spec in &self.entities {
            if ctx.find_by_name(&spec.name).is_some() {
                return Err(StateError::Scenario(format!("duplicate entity '{}'", spec.name)));
            }
            match (&spec.parent, spec.group) {
                (None, false) => {
                    ctx.create_entity(&spec.name);
                }
                (None, true) => {
                    ctx.create_group(&spec.name);
                }
                (Some(parent), false) => {
                    ctx.create_child(&lookup(&ctx, parent)?, &spec.name)?;
                }
                (Some(parent), true) => {
                    ctx.create_child_group(&lookup(&ctx, parent)?, &spec.name)?;
                }
            }
        }

        for spec in &self.entities {
            let member = lookup(&ctx, &spec.name)?;
            for group in &spec.members_of {
                ctx.add_member(&lookup(&ctx, group)?, &member)?;
            }
        }

        for spec in &self.entities {
            logic::attach_default_enrichers(&lookup(&ctx, &spec.name)?)?;
        }
        for spec in &self.entities {
            if let Some(options) = &spec.aggregate {
                let config = ChildAggregatorConfig::from_options(options, &default_quorum_parser)?;
                ChildAggregator::attach(&lookup(&ctx, &spec.name)?, config)?;
            }
        }

        Ok(ctx)
    }

    pub async fn run(&self) -> Result<ScenarioReport> {
        let ctx = self.build()?;
        let expected_config = self.expected_state_config()?;

        let initial = snapshot(&ctx);
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            apply(&ctx, step, &expected_config).await?;
            steps.push(StepReport {
                step: index + 1,
                description: step.to_string(),
                entities: snapshot(&ctx),
            });
        }

        Ok(ScenarioReport {
            name: self.name.clone(),
            initial,
            steps,
        })
    }
}

fn lookup(ctx: &ManagementContext, name: &str) -> Result<Entity> {
    ctx.find_by_name(name)
        .ok_or_else(|| StateError::Scenario(format!("unknown entity '{}'", name)))
}

fn snapshot(ctx: &ManagementContext) -> Vec<HealthSnapshot> {
    ctx.entities().iter().map(HealthSnapshot::of).collect()
}

async fn apply(ctx: &ManagementContext, step: &Step, expected_config: &ExpectedStateConfig) -> Result<()> {
    match step {
        Step::NotUp { entity, key, value } => {
            logic::update_not_up_indicator(&lookup(ctx, entity)?, key, value.clone());
        }
        Step::ClearNotUp { entity, key } => {
            logic::clear_not_up_indicator(&lookup(ctx, entity)?, key);
        }
        Step::Problem { entity, key, value } => {
            logic::update_problems_indicator(&lookup(ctx, entity)?, key, value.clone());
        }
        Step::ClearProblem { entity, key } => {
            logic::clear_problems_indicator(&lookup(ctx, entity)?, key);
        }
        Step::Expect { entity, state } => {
            logic::set_expected_state_with(&lookup(ctx, entity)?, *state, expected_config).await;
        }
        Step::SetUp { entity, up } => {
            let entity = lookup(ctx, entity)?;
            match up {
                Some(up) => entity.set_attribute(Sensor::ServiceUp, SensorValue::Bool(*up)),
                None => {
                    entity.remove_attribute(Sensor::ServiceUp);
                }
            }
        }
        Step::SetActual { entity, state } => {
            let entity = lookup(ctx, entity)?;
            match state {
                Some(state) => entity.set_attribute(Sensor::ServiceStateActual, SensorValue::State(*state)),
                None => {
                    entity.remove_attribute(Sensor::ServiceStateActual);
                }
            }
        }
        Step::AddMember { group, member } => {
            ctx.add_member(&lookup(ctx, group)?, &lookup(ctx, member)?)?;
        }
        Step::RemoveMember { group, member } => {
            ctx.remove_member(&lookup(ctx, group)?, &lookup(ctx, member)?);
        }
        Step::Unmanage { entity } => {
            ctx.unmanage(&lookup(ctx, entity)?)?;
        }
        Step::Reconfigure {
            entity,
            tag,
            options,
        } => {
            let entity = lookup(ctx, entity)?;
            let tag = tag.as_deref().unwrap_or(DEFAULT_AGGREGATOR_TAG);
            let aggregator = entity.enricher_as::<ChildAggregator>(tag).ok_or_else(|| {
                StateError::Scenario(format!("'{}' has no aggregator tagged '{}'", entity, tag))
            })?;
            for (name, value) in options {
                aggregator.reconfigure_named(name, value, &default_quorum_parser)?;
            }
        }
    }
    Ok(())
}
