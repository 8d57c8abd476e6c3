// ============================================================================
// Service Up
// ============================================================================

use super::Reevaluation;
use crate::core::{IndicatorMap, Result};
use crate::entity::{
    Enricher, Entity, Sensor, SensorEvent, SensorEventListener, SensorValue, SubscriptionTarget,
    WeakEntity, read_lock, write_lock,
};
use std::any::Any;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

pub const DEFAULT_SERVICE_UP_TAG: &str = "service.isUp if no service.notUp.indicators";

/// `serviceUp` implied by a not-up map: absent map means unknown
pub fn compute_service_up(not_up: Option<&IndicatorMap>) -> Option<bool> {
    not_up.map(|map| map.is_empty())
}

/// Publishes `serviceUp = true` exactly when the not-up indicator map is empty
pub struct ServiceUpComputer {
    unique_tag: String,
    entity: RwLock<Option<WeakEntity>>,
    evaluation: Reevaluation,
}

impl ServiceUpComputer {
    pub fn new() -> Self {
        Self::with_unique_tag(DEFAULT_SERVICE_UP_TAG)
    }

    pub fn with_unique_tag(tag: &str) -> Self {
        Self {
            unique_tag: tag.to_string(),
            entity: RwLock::new(None),
            evaluation: Reevaluation::new(),
        }
    }

    /// Create and attach to `entity`
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
            debug!(entity = %entity, "skipping service-up recompute, entity no longer managed");
            return;
        }

        match compute_service_up(entity.not_up_indicators().as_ref()) {
            None => {
                if entity.remove_attribute(Sensor::ServiceUp).is_some() {
                    trace!(entity = %entity, "cleared service up");
                }
            }
            Some(up) => {
                let published = entity.modify(Sensor::ServiceUp, |current| {
                    if current.and_then(|v| v.as_bool()) == Some(up) {
                        None
                    } else {
                        Some(SensorValue::Bool(up))
                    }
                });
                if published.is_some() {
                    trace!(entity = %entity, up, "published service up");
                }
            }
        }
    }
}

impl Default for ServiceUpComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorEventListener for ServiceUpComputer {
    fn on_event(&self, _event: &SensorEvent) {
        self.recompute();
    }
}

impl Enricher for ServiceUpComputer {
    fn unique_tag(&self) -> String {
        self.unique_tag.clone()
    }

    fn set_entity(self: Arc<Self>, entity: &Entity) -> Result<()> {
        *write_lock(&self.entity) = Some(entity.downgrade());
        entity.subscriptions().subscribe(
            entity.id(),
            &self.unique_tag,
            SubscriptionTarget::Entity(entity.id()),
            Sensor::ServiceNotUpIndicators,
            self.clone(),
        )?;
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
    use crate::logic::{clear_not_up_indicator, update_not_up_indicator};

    #[test]
    fn test_compute_service_up() {
        assert_eq!(compute_service_up(None), None);
        assert_eq!(compute_service_up(Some(&IndicatorMap::new())), Some(true));
        assert_eq!(
            compute_service_up(Some(&IndicatorMap::new().with("k", "down"))),
            Some(false)
        );
    }

    #[test]
    fn test_follows_not_up_map() {
        let ctx = ManagementContext::new();
        let entity = ctx.create_entity("web");
        ServiceUpComputer::attach(&entity).unwrap();

        assert_eq!(entity.service_up(), None);

        update_not_up_indicator(&entity, "process", "not started");
        assert_eq!(entity.service_up(), Some(false));

        clear_not_up_indicator(&entity, "process");
        assert_eq!(entity.service_up(), Some(true));

        entity.remove_attribute(Sensor::ServiceNotUpIndicators);
        assert_eq!(entity.service_up(), None);
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let ctx = ManagementContext::new();
        let entity = ctx.create_entity("web");
        ServiceUpComputer::attach(&entity).unwrap();
        assert!(ServiceUpComputer::attach(&entity).is_err());
        assert_eq!(entity.enrichers().len(), 1);
    }
}
