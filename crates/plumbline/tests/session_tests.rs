mod fixtures;

use std::cell::RefCell;
use std::rc::Rc;

use fixtures::{props, TestFixture};
use plumbconf::SessionConfig;
use plumbline::proxy::execute_base_step;
use plumbline::{
    interfaces, Constraint, Core, Features, GlobalClaims, Interest, LocalObject, ObjectManager,
    ObjectType, Proxy, ProxyImpl, RemoteCall, SessionError, Step, Transition, TypeEntry,
    TypeRegistry, Value, Verb, STEP_BIND,
};
use pretty_assertions::assert_eq;

type Outcome = Rc<RefCell<Option<Result<(), SessionError>>>>;

fn activate(proxy: &Proxy, features: Features) -> Outcome {
    let outcome = Rc::new(RefCell::new(None));
    let out = outcome.clone();
    proxy.activate(features, move |_, result| *out.borrow_mut() = Some(result));
    outcome
}

fn audio_sinks() -> ObjectManager {
    let manager = ObjectManager::new();
    manager.add_interest(
        ObjectType::Node,
        vec![Constraint::global("media.class", Verb::Matches("Audio/*".into()))],
        Features::BOUND | Features::INFO,
    );
    manager
}

#[test]
fn test_watched_node_appears_with_info_and_leaves_on_removal() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.settle();

    let manager = audio_sinks();
    let log = fixture.install(&manager);
    fixture.settle();

    assert_eq!(log.take(), vec!["added Node<5>", "installed", "changed"]);
    let object = manager.iterate().next().unwrap();
    let proxy = object.as_proxy().unwrap();
    assert_eq!(proxy.bound_id(), Some(5));
    assert!(proxy.active_features().contains(Features::BOUND | Features::INFO));
    assert_eq!(
        proxy.info().and_then(|i| i.get("node.name").map(String::from)),
        Some("sink1".to_string())
    );
    let handle = proxy.handle().unwrap();

    fixture.remote.retract(5);
    fixture.settle();

    assert_eq!(log.take(), vec!["removed Node<5>", "changed"]);
    assert_eq!(manager.n_objects(), 0);
    assert!(fixture.core.global(5).is_none());
    assert!(fixture.remote.calls().contains(&RemoteCall::Destroy { handle }));
}

#[test]
fn test_nodes_outside_the_interest_are_not_bound() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.announce_node(6, "cam", "Video/Source");
    fixture.settle();

    let manager = audio_sinks();
    fixture.install(&manager);
    fixture.settle();

    assert_eq!(manager.n_objects(), 1);
    assert_eq!(fixture.remote.bind_count(5), 1);
    assert_eq!(fixture.remote.bind_count(6), 0);
}

const STEP_WARM_UP: Step = Step::Custom(10);

fn warm() -> Features {
    Features::custom(0)
}

/// Needs an external grant after binding before its custom feature is ready.
struct SlowNode;

impl ProxyImpl for SlowNode {
    fn supported_features(&self) -> Features {
        Features::BOUND | warm()
    }

    fn next_step(&self, proxy: &Proxy, _step: Step, missing: Features) -> Step {
        if !proxy.active_features().contains(Features::BOUND) {
            STEP_BIND
        } else if missing.contains(warm()) {
            STEP_WARM_UP
        } else {
            Step::Error
        }
    }

    fn execute_step(&self, proxy: &Proxy, transition: &Transition, step: Step, _missing: Features) {
        if step != STEP_WARM_UP {
            execute_base_step(proxy, transition, step);
        }
    }
}

fn slow_node() -> Box<dyn ProxyImpl> {
    Box::new(SlowNode)
}

fn slow_fixture() -> (TestFixture, ObjectManager) {
    let mut types = TypeRegistry::with_defaults();
    types.register(TypeEntry::new("Test:Interface:Slow", 1, ObjectType::Node, slow_node));
    let fixture = TestFixture::with_types(types);
    fixture
        .remote
        .announce_at(7, "Test:Interface:Slow", 1, props(&[("node.name", "slow")]));
    fixture.settle();

    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Node, vec![], warm());
    (fixture, manager)
}

#[test]
fn test_custom_step_completes_on_external_grant() {
    let (fixture, manager) = slow_fixture();
    let log = fixture.install(&manager);
    fixture.settle();

    let proxy = fixture.core.global(7).and_then(|g| g.proxy()).unwrap();
    assert_eq!(proxy.active_features(), Features::BOUND);
    assert_eq!(manager.n_objects(), 0);
    assert!(!manager.is_installed());

    proxy.update_features(warm(), Features::empty());
    fixture.settle();

    assert_eq!(log.take(), vec!["added Node<7>", "installed", "changed"]);
    assert_eq!(proxy.active_features(), Features::BOUND | warm());
}

#[test]
fn test_global_removed_during_activation_aborts_it() {
    let (fixture, manager) = slow_fixture();
    let log = fixture.install(&manager);
    fixture.settle();

    let proxy = fixture.core.global(7).and_then(|g| g.proxy()).unwrap();
    let joined = activate(&proxy, warm());
    assert_eq!(fixture.remote.bind_count(7), 1);

    fixture.remote.retract(7);
    fixture.settle();

    assert!(matches!(
        joined.borrow().as_ref(),
        Some(Err(SessionError::Aborted(_)))
    ));
    assert_eq!(log.take(), vec!["installed"]);
    assert!(proxy.active_features().is_empty());
    assert!(proxy.handle().is_none());
    assert!(fixture.core.global(7).is_none());
}

#[test]
fn test_created_object_merges_in_either_event_order() {
    for bound_first in [true, false] {
        let fixture = TestFixture::new();
        fixture.remote.set_bound_before_global(bound_first);
        let manager = ObjectManager::new();
        manager.add_interest(ObjectType::Node, vec![], Features::empty());
        let log = fixture.install(&manager);

        let proxy = Proxy::from_factory(
            &fixture.core,
            "support.null-audio-sink",
            interfaces::NODE,
            props(&[("node.name", "made-here")]),
        )
        .unwrap();
        let outcome = activate(&proxy, Features::BOUND);
        fixture.settle();

        assert_eq!(*outcome.borrow(), Some(Ok(())), "bound_first={bound_first}");
        let globals = fixture.core.globals();
        assert_eq!(globals.len(), 1, "bound_first={bound_first}");
        let global = &globals[0];
        assert_eq!(global.claims(), GlobalClaims::all());
        assert_eq!(global.object_type(), ObjectType::Node);
        assert!(global.proxy().is_some_and(|p| p.ptr_eq(&proxy)));
        assert_eq!(global.properties().get("node.name"), Some("made-here"));

        let objects: Vec<_> = manager.iterate().collect();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].as_proxy().is_some_and(|p| p.ptr_eq(&proxy)));
        assert_eq!(log.count("changed"), 1, "bound_first={bound_first}");
    }
}

#[test]
fn test_changes_coalesce_per_round_trip() {
    let fixture = TestFixture::new();
    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Plugin, vec![], Features::empty());
    let log = fixture.install(&manager);
    assert_eq!(log.take(), vec!["installed"]);

    for name in ["a", "b", "c"] {
        fixture.core.register_object(LocalObject::plugin(name));
    }
    assert_eq!(manager.n_objects(), 3);
    assert_eq!(log.count("changed"), 0);

    fixture.settle();

    assert_eq!(
        log.take(),
        vec!["added Plugin<a>", "added Plugin<b>", "added Plugin<c>", "changed"]
    );
}

#[test]
fn test_shared_node_is_bound_once() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.settle();

    let first = audio_sinks();
    let second = ObjectManager::new();
    second.add_interest(ObjectType::Node, vec![], Features::BOUND);
    fixture.install(&first);
    fixture.install(&second);
    fixture.settle();

    assert_eq!(fixture.remote.bind_count(5), 1);
    let a = first.iterate().next().unwrap();
    let b = second.iterate().next().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_denied_bind_is_never_added() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "secret", "Audio/Sink");
    fixture.remote.deny_bind(5, -13, "permission denied");
    fixture.settle();

    let manager = audio_sinks();
    let log = fixture.install(&manager);
    fixture.settle();

    assert_eq!(log.take(), vec!["installed"]);
    assert_eq!(manager.n_objects(), 0);
    assert!(fixture.remote.handles_for(5).is_empty());
}

#[test]
fn test_requested_params_are_cached() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.remote.add_param(5, 3, serde_json::json!({"channels": 2}));
    fixture.settle();

    let manager = audio_sinks();
    manager.request_object_features(ObjectType::GlobalProxy, Features::PARAMS);
    fixture.install(&manager);
    fixture.settle();

    let object = manager.iterate().next().unwrap();
    let proxy = object.as_proxy().unwrap();
    assert!(proxy.active_features().contains(Features::PARAMS));
    assert_eq!(proxy.params(), vec![(3, serde_json::json!({"channels": 2}))]);
}

#[test]
fn test_malformed_constraint_is_dropped() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.announce_node(6, "cam", "Video/Source");
    fixture.settle();

    let manager = ObjectManager::new();
    manager.add_interest(
        ObjectType::Node,
        vec![
            Constraint::global("media.class", Verb::Matches("[".into())),
            Constraint::global("media.class", Verb::Equals(Value::from("Video/Source"))),
        ],
        Features::empty(),
    );
    fixture.install(&manager);
    fixture.settle();

    let object = manager.iterate().next().unwrap();
    assert_eq!(object.field("bound-id").as_deref(), Some("6"));
    assert_eq!(manager.n_objects(), 1);
}

#[test]
fn test_field_constraint_checked_after_activation() {
    let fixture = TestFixture::new();
    fixture.announce_node(12, "in-range", "Audio/Sink");
    fixture.announce_node(30, "out-of-range", "Audio/Sink");
    fixture.settle();

    let manager = ObjectManager::new();
    manager.add_interest(
        ObjectType::Node,
        vec![Constraint::field(
            "bound-id",
            Verb::InRange(Value::Int(10), Value::Int(20)),
        )],
        Features::empty(),
    );
    fixture.install(&manager);
    fixture.settle();

    let ids: Vec<_> = manager.iterate().filter_map(|o| o.field("bound-id")).collect();
    assert_eq!(ids, vec!["12"]);
    // both had to be bound to learn their bound id
    assert_eq!(fixture.remote.bind_count(30), 1);
}

fn described_speakers() -> ObjectManager {
    let manager = ObjectManager::new();
    manager.add_interest(
        ObjectType::Node,
        vec![Constraint::property(
            "node.description",
            Verb::Equals("Speakers".into()),
        )],
        Features::BOUND,
    );
    manager
}

#[test]
fn test_property_constraints_force_info() {
    let fixture = TestFixture::new();
    fixture.remote.announce_at(
        4,
        interfaces::NODE,
        3,
        props(&[("node.description", "Speakers")]),
    );
    fixture.settle();

    let manager = described_speakers();
    fixture.install(&manager);
    fixture.settle();

    assert_eq!(manager.n_objects(), 1);
}

#[test]
fn test_property_constraints_without_forced_info() {
    let remote = plumbline::LoopbackRemote::new();
    let config = SessionConfig {
        force_info_for_property_constraints: false,
        ..SessionConfig::default()
    };
    let core = Core::with_config(remote.clone(), TypeRegistry::with_defaults(), &config);
    remote.announce_at(4, interfaces::NODE, 3, props(&[("node.description", "Speakers")]));
    core.run_until_idle();

    let manager = described_speakers();
    core.install_object_manager(&manager);
    core.run_until_idle();

    assert_eq!(manager.n_objects(), 0);
    assert!(manager.is_installed());
}

#[test]
fn test_bare_global_is_listed_but_never_matched() {
    let fixture = TestFixture::new();
    fixture.remote.announce_at(2, "Vendor:Interface:Thing", 1, props(&[]));
    fixture.settle();

    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::GlobalProxy, vec![], Features::empty());
    fixture.install(&manager);
    fixture.settle();

    let global = fixture.core.global(2).unwrap();
    assert_eq!(global.object_type(), ObjectType::GlobalProxy);
    assert!(global.proxy().is_none());
    assert_eq!(manager.n_objects(), 0);
    assert_eq!(fixture.remote.bind_count(2), 0);
}

#[test]
fn test_reused_id_is_a_new_object() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "first", "Audio/Sink");
    fixture.settle();
    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Node, vec![], Features::empty());
    let log = fixture.install(&manager);
    fixture.settle();
    let before = fixture.core.global(5).unwrap();
    log.take();

    fixture.remote.retract(5);
    fixture.announce_node(5, "second", "Audio/Sink");
    fixture.settle();

    assert_eq!(
        log.take(),
        vec!["removed Node<5>", "changed", "added Node<5>", "changed"]
    );
    let after = fixture.core.global(5).unwrap();
    assert!(!after.ptr_eq(&before));
    assert_eq!(after.properties().get("node.name"), Some("second"));
}

#[test]
fn test_disconnect_reports_every_removal() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.settle();
    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Object, vec![], Features::empty());
    let log = fixture.install(&manager);
    fixture.core.register_object(LocalObject::plugin("p"));
    fixture.settle();
    assert_eq!(manager.n_objects(), 2);
    log.take();

    fixture.core.disconnect();
    fixture.settle();

    assert_eq!(manager.n_objects(), 0);
    assert!(fixture.core.globals().is_empty());
    assert_eq!(log.count("changed"), 1);
    assert_eq!(log.take().len(), 3);
}

#[test]
fn test_changes_still_reported_after_disconnect_mid_flush() {
    let fixture = TestFixture::new();
    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Plugin, vec![], Features::empty());
    let log = fixture.install(&manager);
    assert_eq!(log.take(), vec!["installed"]);

    fixture.core.register_object(LocalObject::plugin("a"));
    fixture.core.disconnect();
    fixture.settle();
    assert_eq!(
        log.take(),
        vec!["added Plugin<a>", "removed Plugin<a>", "changed"]
    );

    fixture.core.register_object(LocalObject::plugin("b"));
    fixture.settle();
    assert_eq!(log.take(), vec!["added Plugin<b>", "changed"]);
}

#[test]
fn test_unregistering_matched_object_reports_removal_once() {
    let fixture = TestFixture::new();
    let manager = ObjectManager::new();
    manager.add_interest(
        ObjectType::SessionItem,
        vec![Constraint::property("item.kind", Verb::Equals("audio".into()))],
        Features::empty(),
    );
    let log = fixture.install(&manager);
    let item = LocalObject::session_item("a", props(&[("item.kind", "audio")]));
    fixture.core.register_object(item.clone());
    fixture.settle();
    assert_eq!(
        log.take(),
        vec!["installed", "added SessionItem<a>", "changed"]
    );

    assert!(fixture.core.remove_object(&item));
    fixture.settle();
    assert!(!fixture.core.remove_object(&item));
    fixture.settle();

    assert_eq!(log.take(), vec!["removed SessionItem<a>", "changed"]);
    assert_eq!(manager.n_objects(), 0);
}

#[test]
fn test_rebind_after_deactivating_bound() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.settle();
    let sinks = || Constraint::global("media.class", Verb::Equals("Audio/Sink".into()));
    let manager = ObjectManager::new();
    manager.add_interest(ObjectType::Node, vec![sinks()], Features::BOUND);
    fixture.install(&manager);
    fixture.settle();
    let proxy = manager
        .iterate()
        .next()
        .and_then(|o| o.as_proxy().cloned())
        .unwrap();

    proxy.deactivate(Features::BOUND);

    assert!(proxy.handle().is_none());
    let global = fixture.core.global(5).unwrap();
    assert!(proxy.global().is_some_and(|g| g.ptr_eq(&global)));
    assert!(global.proxy().is_some_and(|p| p.ptr_eq(&proxy)));
    assert!(manager
        .lookup(&Interest::new(ObjectType::Node).constrain(sinks()))
        .is_some());

    let outcome = activate(&proxy, Features::BOUND);
    fixture.settle();

    assert_eq!(*outcome.borrow(), Some(Ok(())));
    assert_eq!(proxy.bound_id(), Some(5));
    assert_eq!(fixture.remote.bind_count(5), 2);
}

#[test]
fn test_large_ids_are_stored_and_reserved_id_is_ignored() {
    let fixture = TestFixture::new();
    fixture.announce_node(2_000_000_000, "far", "Audio/Sink");
    fixture.announce_node(u32::MAX, "reserved", "Audio/Sink");
    fixture.settle();

    assert!(fixture.core.global(2_000_000_000).is_some());
    assert!(fixture.core.global(u32::MAX).is_none());
    assert_eq!(fixture.core.globals().len(), 1);
}

#[test]
fn test_lookup_by_interest() {
    let fixture = TestFixture::new();
    fixture.announce_node(5, "sink1", "Audio/Sink");
    fixture.announce_node(6, "mic", "Audio/Source");
    fixture.settle();

    let manager = audio_sinks();
    fixture.install(&manager);
    fixture.settle();

    let source = manager.lookup(
        &Interest::new(ObjectType::Node).constrain(Constraint::global(
            "media.class",
            Verb::InList(vec!["Audio/Source".into(), "Audio/Duplex".into()]),
        )),
    );
    assert_eq!(source.and_then(|o| o.field("bound-id")).as_deref(), Some("6"));
    assert!(manager
        .lookup(&Interest::new(ObjectType::Port))
        .is_none());
}

#[tokio::test]
async fn test_activate_future_resolves_after_events() {
    let fixture = TestFixture::new();
    let proxy = Proxy::from_factory(
        &fixture.core,
        "adapter",
        interfaces::NODE,
        props(&[("media.class", "Audio/Sink")]),
    )
    .unwrap();

    let pending = proxy.activate_future(Features::BOUND | Features::INFO);
    fixture.settle();

    assert_eq!(pending.await, Ok(()));
    assert!(proxy.active_features().contains(Features::INFO));
    assert_eq!(proxy.activate_future(Features::BOUND).await, Ok(()));
}

#[tokio::test]
async fn test_activate_future_reports_abort() {
    let fixture = TestFixture::new();
    let proxy = Proxy::from_factory(&fixture.core, "adapter", interfaces::NODE, props(&[])).unwrap();

    let pending = proxy.activate_future(Features::BOUND);
    proxy.abort_activation("cancelled");

    assert_eq!(
        pending.await,
        Err(SessionError::Aborted("cancelled".to_string()))
    );
}
