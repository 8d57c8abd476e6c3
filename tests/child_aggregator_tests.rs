/// Child aggregator tests
///
/// Roster rollups over children and group members, quorum handling and
/// runtime reconfiguration
/// Run with: cargo test --test child_aggregator_tests

use serde_json::json;
use servicestate::logic::config::{DEFAULT_AGGREGATOR_TAG, DEFAULT_AGGREGATOR_UP_TAG};
use servicestate::logic::{default_quorum_parser, not_up_indicator, problems_indicator};
use servicestate::{
    AggregatorOption, ChildAggregator, ChildAggregatorConfig, Entity, LifecycleState,
    ManagementContext, QuorumPolicy, Sensor, SensorValue, StateError, attach_default_enrichers,
};
use std::sync::Arc;

fn report(entity: &Entity, up: Option<bool>, actual: Option<LifecycleState>) {
    match up {
        Some(up) => entity.set_attribute(Sensor::ServiceUp, SensorValue::Bool(up)),
        None => {
            entity.remove_attribute(Sensor::ServiceUp);
        }
    }
    match actual {
        Some(state) => entity.set_attribute(Sensor::ServiceStateActual, SensorValue::State(state)),
        None => {
            entity.remove_attribute(Sensor::ServiceStateActual);
        }
    }
}

fn not_up_entry(entity: &Entity) -> Option<String> {
    not_up_indicator(entity, DEFAULT_AGGREGATOR_TAG).and_then(|v| v.as_str().map(String::from))
}

fn problems_entry(entity: &Entity) -> Option<String> {
    problems_indicator(entity, DEFAULT_AGGREGATOR_TAG).and_then(|v| v.as_str().map(String::from))
}

#[test]
fn test_roster_change_convergence() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();

    // zero children is quorate by default
    assert_eq!(not_up_entry(&parent), None);
    assert_eq!(problems_entry(&parent), None);
    assert!(parent.not_up_indicators().is_some());

    let child = ctx.create_child(&parent, "child").unwrap();
    report(&child, Some(false), Some(LifecycleState::OnFire));

    assert_eq!(not_up_entry(&parent).as_deref(), Some("child is not up"));
    assert_eq!(
        problems_entry(&parent).as_deref(),
        Some("Required entity not healthy: child")
    );

    ctx.remove_child(&parent, &child);

    assert_eq!(not_up_entry(&parent), None);
    assert_eq!(problems_entry(&parent), None);
}

#[test]
fn test_quorum_boundaries() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();

    let a = ctx.create_child(&parent, "a").unwrap();
    let b = ctx.create_child(&parent, "b").unwrap();
    let c = ctx.create_child(&parent, "c").unwrap();

    report(&a, Some(true), Some(LifecycleState::Running));
    report(&b, Some(true), Some(LifecycleState::Running));
    report(&c, Some(false), Some(LifecycleState::OnFire));
    // 2 of 3 up satisfies "at least one"
    assert_eq!(not_up_entry(&parent), None);
    assert_eq!(
        problems_entry(&parent).as_deref(),
        Some("Required entity not healthy: c")
    );

    report(&a, Some(false), Some(LifecycleState::OnFire));
    report(&b, Some(false), Some(LifecycleState::OnFire));
    assert_eq!(
        not_up_entry(&parent).as_deref(),
        Some("None of the entities are up")
    );
    assert_eq!(
        problems_entry(&parent).as_deref(),
        Some("Required entities not healthy: a, b, c")
    );
}

#[test]
fn test_both_running_is_healthy() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();

    for name in ["x", "y"] {
        let child = ctx.create_child(&parent, name).unwrap();
        report(&child, Some(true), Some(LifecycleState::Running));
    }

    assert_eq!(problems_entry(&parent), None);
    assert_eq!(not_up_entry(&parent), None);
}

#[test]
fn test_group_members_are_aggregated() {
    let ctx = ManagementContext::new();
    let cluster = ctx.create_group("cluster");
    let aggregator = ChildAggregator::attach(
        &cluster,
        ChildAggregatorConfig::default().up_quorum(QuorumPolicy::AtLeast(2)),
    )
    .unwrap();
    assert_eq!(aggregator.config().include_members, Some(true));

    let node1 = ctx.create_entity("node-1");
    let node2 = ctx.create_entity("node-2");
    report(&node1, Some(true), Some(LifecycleState::Running));
    report(&node2, Some(true), Some(LifecycleState::Running));

    ctx.add_member(&cluster, &node1).unwrap();
    assert_eq!(not_up_entry(&cluster).as_deref(), Some("Not enough entities"));

    ctx.add_member(&cluster, &node2).unwrap();
    assert_eq!(not_up_entry(&cluster), None);

    // leaving the group drops the member from the roster
    ctx.remove_member(&cluster, &node2);
    assert_eq!(not_up_entry(&cluster).as_deref(), Some("Not enough entities"));

    // changes to a former member are no longer seen
    report(&node2, Some(false), Some(LifecycleState::OnFire));
    assert_eq!(problems_entry(&cluster), None);
}

#[test]
fn test_child_and_member_counted_once() {
    let ctx = ManagementContext::new();
    let cluster = ctx.create_group("cluster");
    ChildAggregator::attach(&cluster, ChildAggregatorConfig::default()).unwrap();

    let node = ctx.create_child(&cluster, "node").unwrap();
    ctx.add_member(&cluster, &node).unwrap();
    let other = ctx.create_child(&cluster, "other").unwrap();
    report(&node, Some(false), Some(LifecycleState::OnFire));
    report(&other, Some(true), Some(LifecycleState::Running));

    // one violator out of two, not two out of three
    assert_eq!(
        problems_entry(&cluster).as_deref(),
        Some("Required entity not healthy: node")
    );
    assert_eq!(not_up_entry(&cluster), None);
}

#[test]
fn test_members_on_plain_entity_rejected() {
    let ctx = ManagementContext::new();
    let plain = ctx.create_entity("plain");

    let result = ChildAggregator::attach(&plain, ChildAggregatorConfig::default().include_members(true));
    assert!(matches!(result, Err(StateError::InvalidConfiguration(_))));

    let result = ChildAggregator::attach(&plain, ChildAggregatorConfig::default().members_only());
    assert!(matches!(result, Err(StateError::InvalidConfiguration(_))));

    // failed attachment leaves nothing behind
    assert!(plain.enrichers().is_empty());
    assert_eq!(ctx.subscriptions().subscription_count_for(plain.id()), 0);
    assert_eq!(plain.not_up_indicators(), None);
}

#[test]
fn test_inclusion_fixed_after_attach() {
    let ctx = ManagementContext::new();
    let cluster = ctx.create_group("cluster");
    let aggregator = ChildAggregator::attach(&cluster, ChildAggregatorConfig::default()).unwrap();

    for option in [
        AggregatorOption::IncludeChildren(false),
        AggregatorOption::IncludeMembers(false),
        AggregatorOption::UniqueTag("other".to_string()),
    ] {
        assert!(matches!(
            aggregator.reconfigure(option),
            Err(StateError::InvalidConfiguration(_))
        ));
    }
    assert!(aggregator.config().include_children);

    // detached aggregators may still change inclusion
    let detached = ChildAggregator::new(ChildAggregatorConfig::default());
    detached.reconfigure(AggregatorOption::IncludeMembers(false)).unwrap();
    assert_eq!(detached.config().include_members, Some(false));
}

#[test]
fn test_reconfigure_named_option() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    let aggregator = ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();

    assert_eq!(problems_entry(&parent), None);
    aggregator
        .reconfigure_named(
            "enricher.service_state.children_and_members.quorum.running",
            &json!("allAndAtLeastOne"),
            &default_quorum_parser,
        )
        .unwrap();
    assert_eq!(
        problems_entry(&parent).as_deref(),
        Some("Not enough entities running to be quorate")
    );

    let unknown = aggregator.reconfigure_named("enricher.nope", &json!(1), &default_quorum_parser);
    assert!(matches!(unknown, Err(StateError::UnknownOption(_))));

    let bad_quorum = aggregator.reconfigure_named(
        "enricher.service_state.children_and_members.quorum.up",
        &json!("most"),
        &default_quorum_parser,
    );
    assert!(matches!(bad_quorum, Err(StateError::InvalidConfiguration(_))));
}

#[test]
fn test_disabling_a_summary_retracts_its_entry() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    let aggregator = ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();
    let child = ctx.create_child(&parent, "child").unwrap();
    report(&child, Some(false), Some(LifecycleState::OnFire));
    assert!(problems_entry(&parent).is_some());

    aggregator
        .reconfigure(AggregatorOption::PublishProblems(false))
        .unwrap();
    assert_eq!(problems_entry(&parent), None);
    assert!(not_up_entry(&parent).is_some());

    // further changes leave problems alone
    report(&child, Some(false), Some(LifecycleState::Starting));
    assert_eq!(problems_entry(&parent), None);
}

#[test]
fn test_aggregators_keep_separate_entries() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    ChildAggregator::attach(&parent, ChildAggregatorConfig::from_children_state()).unwrap();
    ChildAggregator::attach(&parent, ChildAggregatorConfig::from_children_up()).unwrap();

    let child = ctx.create_child(&parent, "child").unwrap();
    report(&child, Some(false), Some(LifecycleState::OnFire));

    let not_up = parent.not_up_indicators().unwrap();
    assert_eq!(not_up.len(), 1);
    assert!(not_up.contains_key(DEFAULT_AGGREGATOR_UP_TAG));

    let problems = parent.service_problems().unwrap();
    assert_eq!(problems.len(), 1);
    assert!(problems.contains_key(DEFAULT_AGGREGATOR_TAG));

    // a third one with a tag already in use is refused
    let duplicate = ChildAggregator::attach(&parent, ChildAggregatorConfig::default());
    assert!(matches!(duplicate, Err(StateError::DuplicateEnricher(_))));
}

#[test]
fn test_registry_lookup_by_tag() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    let attached = ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();

    let found: Arc<ChildAggregator> = parent
        .enricher_as::<ChildAggregator>(DEFAULT_AGGREGATOR_TAG)
        .unwrap();
    assert!(Arc::ptr_eq(&attached, &found));
    assert!(parent.enricher_as::<ChildAggregator>("missing").is_none());
}

#[test]
fn test_rollup_through_two_levels() {
    let ctx = ManagementContext::new();
    let app = ctx.create_entity("app");
    servicestate::attach_default_group_enrichers(&app).unwrap();
    let tier = ctx.create_child_group(&app, "tier").unwrap();
    servicestate::attach_default_group_enrichers(&tier).unwrap();

    let node = ctx.create_entity("node");
    attach_default_enrichers(&node).unwrap();
    ctx.add_member(&tier, &node).unwrap();

    servicestate::update_problems_indicator(&node, "disk", "full");
    servicestate::clear_not_up_indicator(&node, "process");
    assert_eq!(node.service_state_actual(), Some(LifecycleState::OnFire));
    assert_eq!(tier.service_state_actual(), Some(LifecycleState::OnFire));
    assert_eq!(app.service_state_actual(), Some(LifecycleState::OnFire));
    assert_eq!(
        problems_indicator(&app, DEFAULT_AGGREGATOR_TAG).and_then(|v| v.as_str().map(String::from)),
        Some("Required entity not healthy: tier".to_string())
    );

    servicestate::clear_problems_indicator(&node, "disk");
    assert_eq!(node.service_state_actual(), Some(LifecycleState::Running));
    assert_eq!(tier.service_state_actual(), Some(LifecycleState::Running));
    assert_eq!(app.service_state_actual(), Some(LifecycleState::Running));
}

#[test]
fn test_unmanaged_parent_is_left_alone() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    let aggregator = ChildAggregator::attach(&parent, ChildAggregatorConfig::default()).unwrap();
    let child = ctx.create_child(&parent, "child").unwrap();

    ctx.unmanage(&parent).unwrap();
    report(&child, Some(false), Some(LifecycleState::OnFire));
    aggregator
        .reconfigure(AggregatorOption::UpQuorum(QuorumPolicy::AtLeastOne))
        .unwrap();

    assert_eq!(parent.not_up_indicators(), None);
    assert_eq!(parent.service_problems(), None);
}

#[test]
fn test_from_options_attach() {
    let ctx = ManagementContext::new();
    let parent = ctx.create_entity("parent");
    let options = json!({
        "enricher.service_state.children_and_members.quorum.up": "all",
        "enricher.unique_tag": "web-tier",
    });
    let config =
        ChildAggregatorConfig::from_options(options.as_object().unwrap(), &default_quorum_parser)
            .unwrap();
    ChildAggregator::attach(&parent, config).unwrap();

    let a = ctx.create_child(&parent, "a").unwrap();
    let b = ctx.create_child(&parent, "b").unwrap();
    report(&a, Some(true), Some(LifecycleState::Running));
    report(&b, Some(false), Some(LifecycleState::OnFire));

    assert_eq!(
        not_up_indicator(&parent, "web-tier").and_then(|v| v.as_str().map(String::from)),
        Some("b is not up".to_string())
    );
}
