// ============================================================================
// Subscriptions and Event Delivery
// ============================================================================
//
// Events are appended to one FIFO queue. The first publisher that finds no
// delivery in progress becomes the drainer and delivers until the queue is
// empty; everyone else only enqueues. Consequences:
// - listeners never run concurrently with each other
// - a write made inside a listener is delivered after that listener returns
// - events from one source/sensor are delivered in publish order
//
// Subscriptions may target one entity, or the children / members of an
// entity. Child and member targets are resolved against the roster at
// delivery time, so roster changes need no re-subscription.
//
// ============================================================================

use super::{Entity, EntityId, Sensor, SensorValue, mutex_lock, read_lock, write_lock};
use crate::core::Result;
use log::{debug, trace};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// A change to one sensor of one entity; `value == None` means removed
#[derive(Clone)]
pub struct SensorEvent {
    source: Entity,
    sensor: Sensor,
    value: Option<SensorValue>,
}

impl SensorEvent {
    pub fn new(source: Entity, sensor: Sensor, value: Option<SensorValue>) -> Self {
        Self {
            source,
            sensor,
            value,
        }
    }

    pub fn source(&self) -> &Entity {
        &self.source
    }

    pub fn sensor(&self) -> Sensor {
        self.sensor
    }

    pub fn value(&self) -> Option<&SensorValue> {
        self.value.as_ref()
    }
}

impl fmt::Debug for SensorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorEvent")
            .field("source", &self.source.name())
            .field("sensor", &self.sensor)
            .field("value", &self.value)
            .finish()
    }
}

pub trait SensorEventListener: Send + Sync {
    fn on_event(&self, event: &SensorEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    Entity(EntityId),
    ChildrenOf(EntityId),
    MembersOf(EntityId),
}

impl SubscriptionTarget {
    fn matches(&self, source: &Entity) -> bool {
        match self {
            SubscriptionTarget::Entity(id) => source.id() == *id,
            SubscriptionTarget::ChildrenOf(parent) => {
                source.parent().map(|p| p.id() == *parent).unwrap_or(false)
            }
            SubscriptionTarget::MembersOf(group) => source.is_member_of(*group),
        }
    }
}

struct Subscription {
    subscriber: EntityId,
    tag: String,
    target: SubscriptionTarget,
    sensor: Sensor,
    listener: Arc<dyn SensorEventListener>,
}

#[derive(Default)]
struct DeliveryQueue {
    pending: VecDeque<SensorEvent>,
    draining: bool,
}

/// Releases the drainer role if a listener panics mid-delivery
struct DrainGuard<'a> {
    queue: &'a Mutex<DeliveryQueue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            mutex_lock(self.queue).draining = false;
        }
    }
}

pub struct SubscriptionManager {
    subscriptions: RwLock<Vec<Subscription>>,
    queue: Mutex<DeliveryQueue>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            queue: Mutex::new(DeliveryQueue::default()),
        }
    }

    /// Register `listener` for changes of `sensor` on `target`.
    ///
    /// `subscriber` and `tag` identify the owner so its subscriptions can be
    /// torn down together.
    pub fn subscribe(
        &self,
        subscriber: EntityId,
        tag: &str,
        target: SubscriptionTarget,
        sensor: Sensor,
        listener: Arc<dyn SensorEventListener>,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.write()?;
        subscriptions.push(Subscription {
            subscriber,
            tag: tag.to_string(),
            target,
            sensor,
            listener,
        });
        debug!(
            "subscribed '{}' of {} to {} on {:?}",
            tag, subscriber, sensor, target
        );
        Ok(())
    }

    /// Drop every subscription owned by `subscriber`; returns how many
    pub fn unsubscribe_all(&self, subscriber: EntityId) -> usize {
        let mut subscriptions = write_lock(&self.subscriptions);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.subscriber != subscriber);
        before - subscriptions.len()
    }

    /// Drop the subscriptions of one enricher of `subscriber`
    pub fn unsubscribe_listener(&self, subscriber: EntityId, tag: &str) -> usize {
        let mut subscriptions = write_lock(&self.subscriptions);
        let before = subscriptions.len();
        subscriptions.retain(|s| !(s.subscriber == subscriber && s.tag == tag));
        before - subscriptions.len()
    }

    pub fn subscription_count_for(&self, subscriber: EntityId) -> usize {
        read_lock(&self.subscriptions)
            .iter()
            .filter(|s| s.subscriber == subscriber)
            .count()
    }

    /// Events queued but not yet delivered
    pub fn pending_events(&self) -> usize {
        mutex_lock(&self.queue).pending.len()
    }

    pub(crate) fn enqueue(&self, event: SensorEvent) {
        mutex_lock(&self.queue).pending.push_back(event);
    }

    /// Deliver queued events unless another thread is already doing so
    pub(crate) fn drain(&self) {
        {
            let mut queue = mutex_lock(&self.queue);
            if queue.draining || queue.pending.is_empty() {
                return;
            }
            queue.draining = true;
        }

        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };

        loop {
            let next = {
                let mut queue = mutex_lock(&self.queue);
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, event: &SensorEvent) {
        let listeners: Vec<Arc<dyn SensorEventListener>> = read_lock(&self.subscriptions)
            .iter()
            .filter(|s| s.sensor == event.sensor() && s.target.matches(event.source()))
            .map(|s| Arc::clone(&s.listener))
            .collect();

        trace!(
            "delivering {} of '{}' to {} listener(s)",
            event.sensor(),
            event.source(),
            listeners.len()
        );

        for listener in listeners {
            listener.on_event(event);
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
