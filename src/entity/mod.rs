// ============================================================================
// Entity Framework
// ============================================================================
//
// Minimal in-memory managed-entity model the health evaluators plug into:
// - typed sensor store with an atomic `modify` (read-copy-update)
// - parent/child tree plus group membership (the roster)
// - enricher attachment keyed by unique tag
//
// Sensor changes are queued on the shared `SubscriptionManager` while the
// store lock is held, then delivered once the lock is released.
//
// ============================================================================

pub mod management;
pub mod subscription;

pub use management::ManagementContext;
pub use subscription::{SensorEvent, SensorEventListener, SubscriptionManager, SubscriptionTarget};

use crate::core::{IndicatorMap, LifecycleState, Result, StateError, Transition};
use log::trace;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use uuid::Uuid;

/// Unique identifier of a managed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        EntityId(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Sensors the health logic reads, writes or listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    ServiceUp,
    ServiceStateActual,
    ServiceStateExpected,
    ServiceNotUpIndicators,
    ServiceProblems,
    // Roster notifications; published but never stored
    ChildAdded,
    ChildRemoved,
    MemberAdded,
    MemberRemoved,
}

impl Sensor {
    pub fn name(&self) -> &'static str {
        match self {
            Sensor::ServiceUp => "service.isUp",
            Sensor::ServiceStateActual => "service.state",
            Sensor::ServiceStateExpected => "service.state.expected",
            Sensor::ServiceNotUpIndicators => "service.notUp.indicators",
            Sensor::ServiceProblems => "service.problems",
            Sensor::ChildAdded => "entity.children.added",
            Sensor::ChildRemoved => "entity.children.removed",
            Sensor::MemberAdded => "group.members.added",
            Sensor::MemberRemoved => "group.members.removed",
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorValue {
    Bool(bool),
    State(LifecycleState),
    Transition(Transition),
    Indicators(IndicatorMap),
    Entity(EntityId),
}

impl SensorValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SensorValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<LifecycleState> {
        match self {
            SensorValue::State(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_transition(&self) -> Option<Transition> {
        match self {
            SensorValue::Transition(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_indicators(&self) -> Option<&IndicatorMap> {
        match self {
            SensorValue::Indicators(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorValue::Bool(b) => write!(f, "{}", b),
            SensorValue::State(s) => write!(f, "{}", s),
            SensorValue::Transition(t) => write!(f, "{}", t),
            SensorValue::Indicators(map) => write!(f, "{}", map),
            SensorValue::Entity(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementState {
    Managed,
    NoLongerManaged,
}

/// A reactive evaluator attached to one entity
pub trait Enricher: SensorEventListener {
    /// Key under which the enricher is registered on its entity
    fn unique_tag(&self) -> String;

    /// Bind to `entity`: validate configuration, subscribe, compute once
    fn set_entity(self: Arc<Self>, entity: &Entity) -> Result<()>;

    /// Re-evaluate from the current sensor snapshot
    fn recompute(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// Readers only ever take snapshots, so a poisoned lock still holds a
// consistent value.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

struct EntityInner {
    id: EntityId,
    name: String,
    group: bool,
    state: RwLock<ManagementState>,
    sensors: RwLock<HashMap<Sensor, SensorValue>>,
    parent: RwLock<Option<WeakEntity>>,
    children: RwLock<Vec<Entity>>,
    members: RwLock<Vec<Entity>>,
    groups: RwLock<Vec<WeakEntity>>,
    enrichers: RwLock<Vec<Arc<dyn Enricher>>>,
    subscriptions: Arc<SubscriptionManager>,
}

/// Cheap, cloneable handle to a managed entity
#[derive(Clone)]
pub struct Entity(Arc<EntityInner>);

/// Non-owning handle held by evaluators so they never keep an entity alive
#[derive(Clone)]
pub struct WeakEntity(Weak<EntityInner>);

impl WeakEntity {
    pub fn upgrade(&self) -> Option<Entity> {
        self.0.upgrade().map(Entity)
    }
}

impl Entity {
    pub(crate) fn new(name: &str, group: bool, subscriptions: Arc<SubscriptionManager>) -> Self {
        Entity(Arc::new(EntityInner {
            id: EntityId::new(),
            name: name.to_string(),
            group,
            state: RwLock::new(ManagementState::Managed),
            sensors: RwLock::new(HashMap::new()),
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            members: RwLock::new(Vec::new()),
            groups: RwLock::new(Vec::new()),
            enrichers: RwLock::new(Vec::new()),
            subscriptions,
        }))
    }

    pub fn id(&self) -> EntityId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether the entity supports a member relation
    pub fn is_group(&self) -> bool {
        self.0.group
    }

    pub fn downgrade(&self) -> WeakEntity {
        WeakEntity(Arc::downgrade(&self.0))
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.0.subscriptions
    }

    // ========================================================================
    // Management state
    // ========================================================================

    pub fn management_state(&self) -> ManagementState {
        *read_lock(&self.0.state)
    }

    pub fn is_managed(&self) -> bool {
        self.management_state() == ManagementState::Managed
    }

    pub fn is_no_longer_managed(&self) -> bool {
        self.management_state() == ManagementState::NoLongerManaged
    }

    pub(crate) fn mark_no_longer_managed(&self) {
        *write_lock(&self.0.state) = ManagementState::NoLongerManaged;
    }

    // ========================================================================
    // Sensors
    // ========================================================================

    pub fn attribute(&self, sensor: Sensor) -> Option<SensorValue> {
        read_lock(&self.0.sensors).get(&sensor).cloned()
    }

    pub fn service_up(&self) -> Option<bool> {
        self.attribute(Sensor::ServiceUp).and_then(|v| v.as_bool())
    }

    pub fn service_state_actual(&self) -> Option<LifecycleState> {
        self.attribute(Sensor::ServiceStateActual)
            .and_then(|v| v.as_state())
    }

    pub fn service_state_expected(&self) -> Option<Transition> {
        self.attribute(Sensor::ServiceStateExpected)
            .and_then(|v| v.as_transition())
    }

    pub fn not_up_indicators(&self) -> Option<IndicatorMap> {
        self.indicators(Sensor::ServiceNotUpIndicators)
    }

    pub fn service_problems(&self) -> Option<IndicatorMap> {
        self.indicators(Sensor::ServiceProblems)
    }

    pub fn indicators(&self, sensor: Sensor) -> Option<IndicatorMap> {
        read_lock(&self.0.sensors)
            .get(&sensor)
            .and_then(|v| v.as_indicators().cloned())
    }

    /// Store and publish `value`, even if it equals the current value.
    ///
    /// Writes to an entity that is no longer managed are dropped; the check
    /// happens under the store lock, so nothing survives `unmanage`.
    pub fn set_attribute(&self, sensor: Sensor, value: SensorValue) {
        {
            let mut sensors = write_lock(&self.0.sensors);
            if !self.is_managed() {
                trace!("dropping write of {} to unmanaged '{}'", sensor, self.name());
                return;
            }
            sensors.insert(sensor, value.clone());
            self.0
                .subscriptions
                .enqueue(SensorEvent::new(self.clone(), sensor, Some(value)));
        }
        self.0.subscriptions.drain();
    }

    /// Remove the sensor, publishing a removal event if it was present
    pub fn remove_attribute(&self, sensor: Sensor) -> Option<SensorValue> {
        let previous = {
            let mut sensors = write_lock(&self.0.sensors);
            if !self.is_managed() {
                return None;
            }
            let previous = sensors.remove(&sensor);
            if previous.is_some() {
                self.0
                    .subscriptions
                    .enqueue(SensorEvent::new(self.clone(), sensor, None));
            }
            previous
        };
        if previous.is_some() {
            self.0.subscriptions.drain();
        }
        previous
    }

    /// Atomically replace a sensor value.
    ///
    /// `modifier` sees the current value and returns the value to publish, or
    /// `None` to leave the sensor untouched. Calls on the same entity are
    /// serialized, so concurrent modifiers never lose each other's updates.
    /// Like every write, a no-op once the entity is no longer managed.
    pub fn modify<F>(&self, sensor: Sensor, modifier: F) -> Option<SensorValue>
    where
        F: FnOnce(Option<&SensorValue>) -> Option<SensorValue>,
    {
        let published = {
            let mut sensors = write_lock(&self.0.sensors);
            if !self.is_managed() {
                trace!("dropping update of {} on unmanaged '{}'", sensor, self.name());
                return None;
            }
            let next = modifier(sensors.get(&sensor));
            if let Some(value) = &next {
                sensors.insert(sensor, value.clone());
                self.0
                    .subscriptions
                    .enqueue(SensorEvent::new(self.clone(), sensor, Some(value.clone())));
            }
            next
        };
        if published.is_some() {
            self.0.subscriptions.drain();
        }
        published
    }

    /// Publish a notification without storing it
    pub(crate) fn emit(&self, sensor: Sensor, value: SensorValue) {
        self.0
            .subscriptions
            .enqueue(SensorEvent::new(self.clone(), sensor, Some(value)));
        self.0.subscriptions.drain();
    }

    /// Drop all stored sensor values without publishing
    pub(crate) fn clear_attributes(&self) {
        write_lock(&self.0.sensors).clear();
    }

    // ========================================================================
    // Roster
    // ========================================================================

    pub fn parent(&self) -> Option<Entity> {
        read_lock(&self.0.parent).as_ref().and_then(|p| p.upgrade())
    }

    pub fn children(&self) -> Vec<Entity> {
        read_lock(&self.0.children).clone()
    }

    /// Members of this group; always empty for non-group entities
    pub fn members(&self) -> Vec<Entity> {
        read_lock(&self.0.members).clone()
    }

    /// Groups this entity is a member of
    pub fn groups(&self) -> Vec<Entity> {
        read_lock(&self.0.groups)
            .iter()
            .filter_map(|g| g.upgrade())
            .collect()
    }

    pub fn is_member_of(&self, group: EntityId) -> bool {
        read_lock(&self.0.groups)
            .iter()
            .filter_map(|g| g.upgrade())
            .any(|g| g.id() == group)
    }

    pub(crate) fn set_parent(&self, parent: Option<&Entity>) {
        *write_lock(&self.0.parent) = parent.map(|p| p.downgrade());
    }

    pub(crate) fn push_child(&self, child: &Entity) {
        write_lock(&self.0.children).push(child.clone());
    }

    pub(crate) fn remove_child(&self, child: EntityId) -> bool {
        let mut children = write_lock(&self.0.children);
        let before = children.len();
        children.retain(|c| c.id() != child);
        children.len() != before
    }

    pub(crate) fn push_member(&self, member: &Entity) -> bool {
        let mut members = write_lock(&self.0.members);
        if members.iter().any(|m| m.id() == member.id()) {
            return false;
        }
        members.push(member.clone());
        write_lock(&member.0.groups).push(self.downgrade());
        true
    }

    pub(crate) fn remove_member(&self, member: &Entity) -> bool {
        let removed = {
            let mut members = write_lock(&self.0.members);
            let before = members.len();
            members.retain(|m| m.id() != member.id());
            members.len() != before
        };
        if removed {
            let group_id = self.id();
            write_lock(&member.0.groups)
                .retain(|g| g.upgrade().map(|g| g.id() != group_id).unwrap_or(false));
        }
        removed
    }

    // ========================================================================
    // Enrichers
    // ========================================================================

    /// Attach an enricher; its unique tag must not already be in use
    pub fn add_enricher(&self, enricher: Arc<dyn Enricher>) -> Result<()> {
        if !self.is_managed() {
            return Err(StateError::EntityNotManaged(self.name().to_string()));
        }
        let tag = enricher.unique_tag();
        {
            let mut enrichers = write_lock(&self.0.enrichers);
            if enrichers.iter().any(|e| e.unique_tag() == tag) {
                return Err(StateError::DuplicateEnricher(tag));
            }
            enrichers.push(Arc::clone(&enricher));
        }
        if let Err(err) = Arc::clone(&enricher).set_entity(self) {
            write_lock(&self.0.enrichers).retain(|e| e.unique_tag() != tag);
            self.0.subscriptions.unsubscribe_listener(self.id(), &tag);
            return Err(err);
        }
        Ok(())
    }

    pub fn enricher(&self, unique_tag: &str) -> Option<Arc<dyn Enricher>> {
        read_lock(&self.0.enrichers)
            .iter()
            .find(|e| e.unique_tag() == unique_tag)
            .cloned()
    }

    /// Look up an enricher by tag and downcast it to its concrete type
    pub fn enricher_as<T: Enricher + 'static>(&self, unique_tag: &str) -> Option<Arc<T>> {
        self.enricher(unique_tag)
            .and_then(|e| e.into_any().downcast::<T>().ok())
    }

    pub fn enrichers(&self) -> Vec<Arc<dyn Enricher>> {
        read_lock(&self.0.enrichers).clone()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Entity {}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.0.name)
            .field("id", &self.0.id)
            .field("group", &self.0.group)
            .finish()
    }
}
