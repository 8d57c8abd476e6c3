// ============================================================================
// Entity Management
// ============================================================================
//
// The registry of managed entities and every roster mutation: parenting,
// group membership and recursive unmanage. Roster checks and the updates
// they guard run under one lock, so two concurrent mutations cannot both
// pass a check that only one of them may pass.
//
// ============================================================================

use super::{
    Entity, EntityId, Sensor, SensorValue, SubscriptionManager, mutex_lock, read_lock, write_lock,
};
use crate::core::{Result, StateError};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Owns the entity registry and the shared subscription manager.
///
/// Health state only ever propagates upward: from a child to its parent and
/// from a member to the groups containing it. Every roster mutation checks
/// that it keeps that propagation graph acyclic.
pub struct ManagementContext {
    subscriptions: Arc<SubscriptionManager>,
    entities: RwLock<HashMap<EntityId, Entity>>,
    /// Held across each roster check and the mutation it guards
    roster: Mutex<()>,
}

impl ManagementContext {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(SubscriptionManager::new()),
            entities: RwLock::new(HashMap::new()),
            roster: Mutex::new(()),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Create a managed top-level entity
    pub fn create_entity(&self, name: &str) -> Entity {
        self.register(Entity::new(name, false, Arc::clone(&self.subscriptions)))
    }

    /// Create a managed top-level entity that supports members
    pub fn create_group(&self, name: &str) -> Entity {
        self.register(Entity::new(name, true, Arc::clone(&self.subscriptions)))
    }

    pub fn create_child(&self, parent: &Entity, name: &str) -> Result<Entity> {
        Self::ensure_managed(parent)?;
        let child = self.create_entity(name);
        self.add_child(parent, &child)?;
        Ok(child)
    }

    pub fn create_child_group(&self, parent: &Entity, name: &str) -> Result<Entity> {
        Self::ensure_managed(parent)?;
        let child = self.create_group(name);
        self.add_child(parent, &child)?;
        Ok(child)
    }

    fn register(&self, entity: Entity) -> Entity {
        write_lock(&self.entities).insert(entity.id(), entity.clone());
        debug!("managing entity '{}' ({})", entity.name(), entity.id());
        entity
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        read_lock(&self.entities).get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Entity> {
        read_lock(&self.entities)
            .values()
            .find(|e| e.name() == name)
            .cloned()
    }

    pub fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = read_lock(&self.entities).values().cloned().collect();
        entities.sort_by(|a, b| a.name().cmp(b.name()));
        entities
    }

    // ========================================================================
    // Roster mutation
    // ========================================================================

    pub fn add_child(&self, parent: &Entity, child: &Entity) -> Result<()> {
        Self::ensure_managed(parent)?;
        Self::ensure_managed(child)?;

        {
            let _roster = mutex_lock(&self.roster);
            if let Some(existing) = child.parent() {
                return Err(StateError::InvalidConfiguration(format!(
                    "'{}' already has parent '{}'",
                    child, existing
                )));
            }
            if propagates_to(parent, child) {
                return Err(StateError::CyclicPropagation(format!(
                    "'{}' cannot be a child of '{}': '{}' already reports into it",
                    child, parent, parent
                )));
            }

            child.set_parent(Some(parent));
            parent.push_child(child);
        }
        debug!("added child '{}' to '{}'", child, parent);
        parent.emit(Sensor::ChildAdded, SensorValue::Entity(child.id()));
        Ok(())
    }

    pub fn remove_child(&self, parent: &Entity, child: &Entity) -> bool {
        {
            let _roster = mutex_lock(&self.roster);
            if !parent.remove_child(child.id()) {
                return false;
            }
            child.set_parent(None);
        }
        debug!("removed child '{}' from '{}'", child, parent);
        parent.emit(Sensor::ChildRemoved, SensorValue::Entity(child.id()));
        true
    }

    pub fn add_member(&self, group: &Entity, member: &Entity) -> Result<bool> {
        Self::ensure_managed(group)?;
        Self::ensure_managed(member)?;

        if !group.is_group() {
            return Err(StateError::InvalidConfiguration(format!(
                "'{}' does not support members",
                group
            )));
        }
        {
            let _roster = mutex_lock(&self.roster);
            if propagates_to(group, member) {
                return Err(StateError::CyclicPropagation(format!(
                    "'{}' cannot be a member of '{}': '{}' already reports into it",
                    member, group, group
                )));
            }
            if !group.push_member(member) {
                return Ok(false);
            }
        }
        debug!("added member '{}' to '{}'", member, group);
        group.emit(Sensor::MemberAdded, SensorValue::Entity(member.id()));
        Ok(true)
    }

    pub fn remove_member(&self, group: &Entity, member: &Entity) -> bool {
        {
            let _roster = mutex_lock(&self.roster);
            if !group.remove_member(member) {
                return false;
            }
        }
        debug!("removed member '{}' from '{}'", member, group);
        group.emit(Sensor::MemberRemoved, SensorValue::Entity(member.id()));
        true
    }

    /// Stop managing `entity` and its descendants.
    ///
    /// Subscriptions owned by the entity are dropped before it leaves its
    /// parent and groups, so the resulting roster notifications reach only
    /// the still-managed ancestors. Stored sensors are cleared silently.
    pub fn unmanage(&self, entity: &Entity) -> Result<()> {
        if entity.is_no_longer_managed() {
            return Ok(());
        }

        for child in entity.children() {
            self.unmanage(&child)?;
        }

        entity.mark_no_longer_managed();
        let dropped = self.subscriptions.unsubscribe_all(entity.id());
        entity.clear_attributes();

        {
            let _roster = mutex_lock(&self.roster);
            for member in entity.members() {
                entity.remove_member(&member);
            }
        }
        if let Some(parent) = entity.parent() {
            self.remove_child(&parent, entity);
        }
        for group in entity.groups() {
            self.remove_member(&group, entity);
        }

        write_lock(&self.entities).remove(&entity.id());
        debug!(
            "unmanaged entity '{}' ({}), dropped {} subscription(s)",
            entity.name(),
            entity.id(),
            dropped
        );
        Ok(())
    }

    fn ensure_managed(entity: &Entity) -> Result<()> {
        if entity.is_managed() {
            Ok(())
        } else {
            Err(StateError::EntityNotManaged(entity.name().to_string()))
        }
    }
}

impl Default for ManagementContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether health state of `from` flows (transitively) into `to`, following
/// parent links and group memberships.
pub fn propagates_to(from: &Entity, to: &Entity) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from.clone()];

    while let Some(current) = stack.pop() {
        if current.id() == to.id() {
            return true;
        }
        if !visited.insert(current.id()) {
            continue;
        }
        if let Some(parent) = current.parent() {
            stack.push(parent);
        }
        stack.extend(current.groups());
    }
    false
}
