//! Cross-module scenarios: scheduling, fault isolation, events, snapshots.

use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth::prelude::*;
use hearth::{
    error::{EventError, SystemRegistryError},
    event::ComponentAdded,
    storage::ComponentTypeId,
    EventBusStats,
};

#[derive(Clone, Debug, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}
impl Component for Position {}

#[derive(Clone, Debug, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
}
impl Component for Velocity {}

#[derive(Clone, Debug, PartialEq)]
struct Transform {
    translation: (f32, f32),
}
impl Component for Transform {}

type RunLog = Arc<Mutex<Vec<&'static str>>>;

macro_rules! logging_system {
    ($name:ident, $label:literal, safety: $safety:expr, components: [$($comp:ty),*]) => {
        struct $name(RunLog);

        impl System for $name {
            fn required_components(&self) -> Vec<TypeId> {
                vec![$(TypeId::of::<$comp>()),*]
            }

            fn thread_safety(&self) -> ThreadSafety {
                $safety
            }

            fn update(&mut self, _world: &World, _dt: f32) -> Result<(), BoxedErr> {
                self.0.lock().unwrap().push($label);
                Ok(())
            }

            fn shutdown(&mut self, _world: &World) -> Result<(), BoxedErr> {
                self.0.lock().unwrap().push(concat!($label, ":shutdown"));
                Ok(())
            }
        }
    };
}

logging_system!(SysA, "A", safety: ThreadSafety::None, components: []);
logging_system!(SysB, "B", safety: ThreadSafety::None, components: []);
logging_system!(SysC, "C", safety: ThreadSafety::None, components: []);
logging_system!(SysP, "P", safety: ThreadSafety::Full, components: [Position]);
logging_system!(SysQ, "Q", safety: ThreadSafety::Full, components: [Velocity]);
logging_system!(SysR, "R", safety: ThreadSafety::Full, components: [Position]);

fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn ent(i: u32) -> Entity {
    Entity::from_raw_parts(i, hearth::Generation::new(1))
}

// S1 -- cycle detection leaves the graph unchanged.
#[test]
fn cycle_detection() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    systems.register(SysB(log.clone())).unwrap();
    systems.register(SysC(log)).unwrap();

    let (a, b, c) = (
        SystemId::of::<SysA>(),
        SystemId::of::<SysB>(),
        SystemId::of::<SysC>(),
    );
    systems.add_dependency(a, b).unwrap();
    systems.add_dependency(b, c).unwrap();
    assert!(matches!(
        systems.add_dependency(c, a),
        Err(SystemRegistryError::CyclicDependency)
    ));
    assert!(systems.get_dependencies(c).unwrap().is_empty());
}

#[test]
fn self_dependency_is_cyclic() {
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(run_log())).unwrap();
    let a = SystemId::of::<SysA>();
    assert!(matches!(
        systems.add_dependency(a, a),
        Err(SystemRegistryError::CyclicDependency)
    ));
}

// S2 -- a failing system is isolated; the tick completes.
#[test]
fn fault_isolation() {
    struct SysU;
    impl System for SysU {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            Ok(())
        }
    }
    struct SysV;
    impl System for SysV {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            Err(BoxedErr::msg("boom"))
        }
    }

    let world = World::new();
    let systems = world.systems();
    systems.register_with_priority(SysU, 50).unwrap();
    systems.register_with_priority(SysV, 10).unwrap();

    world.update(0.016).unwrap();

    let u = systems.metrics(SystemId::of::<SysU>()).unwrap();
    let v = systems.metrics(SystemId::of::<SysV>()).unwrap();
    assert_eq!(u.execution_count, 1);
    assert_eq!(u.error_count, 0);
    assert_eq!(v.execution_count, 1);
    assert_eq!(v.error_count, 1);
    assert_eq!(systems.get_failed_systems(), vec![SystemId::of::<SysV>()]);
    assert!(!systems.error_log(SystemId::of::<SysV>()).unwrap().is_empty());
}

// S3 -- swap-remove keeps the dense array gap-free.
#[test]
fn component_store_swap_remove() {
    let mut world = World::new();
    world.register::<Transform>();

    let (e1, e2, e3) = (
        world.create_entity(),
        world.create_entity(),
        world.create_entity(),
    );
    for (e, x) in [(e1, 1.0f32), (e2, 2.0), (e3, 3.0)] {
        world
            .add_component(e, Transform {
                translation: (x, 0.0),
            })
            .unwrap();
    }

    world.remove_component::<Transform>(e1).unwrap();

    let store = world.read_store::<Transform>().unwrap();
    assert_eq!(store.len(), 2);
    assert!(store.get(e1).is_none());
    let seen: Vec<Entity> = store.iter().map(|(e, _)| e).collect();
    assert!(seen.contains(&e2) && seen.contains(&e3));
}

// S4 -- subscription filter on the event's subject entity.
#[test]
fn event_filter_on_entity_id() {
    let bus = EventBus::new(EventBusConfig::default());
    bus.start();
    bus.register_event_type::<ComponentAdded>();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_with_filter::<ComponentAdded, _, _>(
        |ev| ev.entity.id() == 42,
        move |ev| {
            sink.lock().unwrap().push(ev.entity);
            Ok(())
        },
    )
    .unwrap();

    for id in [42u32, 10, 42] {
        bus.publish(ComponentAdded {
            entity: ent(id),
            component: ComponentTypeId(0),
        })
        .unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|e| e.id() == 42));
    bus.stop();
}

// S5 -- bounded queue under async stress: drops account exactly.
#[test]
fn async_backpressure_accounting() {
    let bus = EventBus::new(EventBusConfig {
        buffer_size: 2,
        num_workers: 1,
        ..Default::default()
    });
    bus.start();
    bus.register_event_type::<ComponentAdded>();
    bus.subscribe::<ComponentAdded, _>(|_| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    })
    .unwrap();

    let mut published = 0u64;
    let mut dropped = 0u64;
    for i in 0..10 {
        match bus.publish_async(ComponentAdded {
            entity: ent(i),
            component: ComponentTypeId(0),
        }) {
            Ok(()) => published += 1,
            Err(EventError::QueueFull) => dropped += 1,
            Err(e) => panic!("unexpected: {}", e),
        }
    }
    assert_eq!(published + dropped, 10);
    assert!((2..=3).contains(&published));
    assert!((7..=8).contains(&dropped));

    let stats: EventBusStats = bus.get_stats();
    assert_eq!(stats.published, published);
    assert_eq!(stats.dropped, dropped);
    bus.stop();
}

// S6 -- systems with overlapping write sets never share a stage.
#[test]
fn parallel_stage_safety() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysP(log.clone())).unwrap();
    systems.register(SysQ(log.clone())).unwrap();
    systems.register(SysR(log)).unwrap();
    systems.set_parallel(true);

    let stages = systems.stages();
    let (p, q, r) = (
        SystemId::of::<SysP>(),
        SystemId::of::<SysQ>(),
        SystemId::of::<SysR>(),
    );
    for stage in &stages {
        assert!(
            !(stage.contains(&p) && stage.contains(&r)),
            "P and R both write Position and must not share a stage: {:?}",
            stages
        );
    }
    // Compatible pair packs together.
    assert!(stages
        .iter()
        .any(|stage| stage.contains(&p) && stage.contains(&q)));

    // The partition is consistent with the stored order.
    assert!(systems.validate_order());
    world.update(0.016).unwrap();
}

#[test]
fn max_parallel_caps_stage_width() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysP(log.clone())).unwrap();
    systems.register(SysQ(log)).unwrap();
    systems.set_parallel(true);
    systems.set_max_parallel_systems(1);

    for stage in systems.stages() {
        assert_eq!(stage.len(), 1);
    }
}

// Property 3: a dependency's update completes before its dependent starts.
#[test]
fn dependency_order_is_respected() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    systems.register(SysB(log.clone())).unwrap();
    // B must run before A.
    systems
        .add_dependency(SystemId::of::<SysA>(), SystemId::of::<SysB>())
        .unwrap();

    for _ in 0..5 {
        world.update(0.016).unwrap();
    }

    let order = log.lock().unwrap();
    let mut last = None;
    for window in order.iter() {
        match *window {
            "B" => last = Some("B"),
            "A" => assert_eq!(last, Some("B"), "A ran before B: {:?}", *order),
            _ => {}
        }
    }
    assert_eq!(order.len(), 10);
}

#[test]
fn priority_breaks_ties() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register_with_priority(SysA(log.clone()), 10).unwrap();
    systems.register_with_priority(SysB(log.clone()), 50).unwrap();
    systems.register_with_priority(SysC(log.clone()), 30).unwrap();

    world.update(0.016).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B", "C", "A"]);
}

#[test]
fn unregister_removes_edges() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    systems.register(SysB(log)).unwrap();
    systems
        .add_dependency(SystemId::of::<SysA>(), SystemId::of::<SysB>())
        .unwrap();

    systems.unregister(SystemId::of::<SysB>()).unwrap();
    assert_eq!(systems.system_count(), 1);
    assert!(systems
        .get_dependencies(SystemId::of::<SysA>())
        .unwrap()
        .is_empty());

    // Re-registering B restores a clean slate.
    let log = run_log();
    systems.register(SysB(log)).unwrap();
    assert!(systems
        .get_dependencies(SystemId::of::<SysB>())
        .unwrap()
        .is_empty());
    systems.execution_order();
    assert!(systems.validate_order());
}

#[test]
fn duplicate_and_nil_registration_fail() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    assert!(matches!(
        systems.register(SysA(log)),
        Err(SystemRegistryError::SystemAlreadyRegistered(_))
    ));
    assert!(matches!(
        systems.register_boxed(SystemId::of::<SysB>(), "SysB", None),
        Err(SystemRegistryError::NilSystem)
    ));
    assert!(matches!(
        systems.add_dependency(SystemId::of::<SysA>(), SystemId::of::<SysB>()),
        Err(SystemRegistryError::InvalidDependency)
    ));
}

#[test]
fn disabled_systems_are_skipped_but_stay_ordered() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    systems.register(SysB(log.clone())).unwrap();

    systems.set_enabled(SystemId::of::<SysA>(), false).unwrap();
    world.update(0.016).unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B"]);
    assert_eq!(systems.execution_order().len(), 2);

    systems.set_enabled(SystemId::of::<SysA>(), true).unwrap();
    world.update(0.016).unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn panicking_system_is_contained() {
    struct Panics;
    impl System for Panics {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            panic!("update exploded");
        }
    }
    struct Healthy(Arc<AtomicUsize>);
    impl System for Healthy {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let ran = Arc::new(AtomicUsize::new(0));
    let world = World::new();
    let systems = world.systems();
    systems.register_with_priority(Panics, 100).unwrap();
    systems.register(Healthy(ran.clone())).unwrap();

    world.update(0.016).unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let metrics = systems.metrics(SystemId::of::<Panics>()).unwrap();
    assert_eq!(metrics.panic_count, 1);
    assert_eq!(metrics.error_count, 1);
    assert!(systems
        .get_failed_systems()
        .contains(&SystemId::of::<Panics>()));
}

#[test]
fn timeout_overrun_is_recorded() {
    struct Slow;
    impl System for Slow {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        }
    }

    let world = World::new();
    let systems = world.systems();
    systems.register(Slow).unwrap();
    systems
        .set_system_timeout(SystemId::of::<Slow>(), Duration::from_millis(1))
        .unwrap();

    world.update(0.016).unwrap();

    let metrics = systems.metrics(SystemId::of::<Slow>()).unwrap();
    assert_eq!(metrics.timeout_count, 1);
    assert!(systems.get_failed_systems().contains(&SystemId::of::<Slow>()));
}

#[test]
fn error_handler_can_escalate() {
    struct Faulty;
    impl System for Faulty {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            Err(BoxedErr::msg("boom"))
        }
    }

    let world = World::new();
    let systems = world.systems();
    systems.register(Faulty).unwrap();
    systems.set_error_handler(Arc::new(|_, err| {
        Err(BoxedErr::msg(format!("escalated: {}", err)))
    }));

    let err = world.update(0.016).unwrap_err();
    assert!(err.to_string().contains("escalated"));
}

#[test]
fn init_failure_refuses_dispatch() {
    struct BadInit;
    impl System for BadInit {
        fn init(&mut self, _: &World) -> Result<(), BoxedErr> {
            Err(BoxedErr::msg("no GPU"))
        }
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            Ok(())
        }
    }

    let world = World::new();
    world.systems().register(BadInit).unwrap();
    assert!(world.initialize().is_err());
    assert!(world.update(0.016).is_err());
}

#[test]
fn shutdown_runs_in_reverse_order() {
    let log = run_log();
    let world = World::new();
    let systems = world.systems();
    systems.register(SysA(log.clone())).unwrap();
    systems.register(SysB(log.clone())).unwrap();
    systems
        .add_dependency(SystemId::of::<SysA>(), SystemId::of::<SysB>())
        .unwrap();

    world.update(0.016).unwrap();
    let errors = world.shutdown();
    assert!(errors.is_empty());

    let order = log.lock().unwrap();
    assert_eq!(
        *order,
        vec!["B", "A", "A:shutdown", "B:shutdown"],
        "shutdown must reverse the execution order"
    );
}

#[test]
fn error_sink_observes_both_failure_kinds() {
    use hearth::{ErrorSink, EventTypeId};

    #[derive(Default)]
    struct CountingSink {
        system_errors: AtomicUsize,
        handler_errors: AtomicUsize,
    }
    impl ErrorSink for CountingSink {
        fn on_system_error(&self, _: SystemId, _: &BoxedErr) {
            self.system_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_handler_error(&self, _: EventTypeId, _: SubscriptionId, _: &BoxedErr) {
            self.handler_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Failing;
    impl System for Failing {
        fn update(&mut self, _: &World, _: f32) -> Result<(), BoxedErr> {
            Err(BoxedErr::msg("boom"))
        }
    }

    let world = World::new();
    let sink = Arc::new(CountingSink::default());
    world.set_error_sink(sink.clone());

    world.systems().register(Failing).unwrap();
    world.update(0.016).unwrap();
    assert_eq!(sink.system_errors.load(Ordering::SeqCst), 1);

    world.events().start();
    world
        .events()
        .subscribe::<ComponentAdded, _>(|_| Err(BoxedErr::msg("handler boom")))
        .unwrap();
    world
        .events()
        .publish(ComponentAdded {
            entity: ent(1),
            component: ComponentTypeId(0),
        })
        .unwrap();
    assert_eq!(sink.handler_errors.load(Ordering::SeqCst), 1);
    world.events().stop();
}

#[test]
fn empty_world_tick_is_ok() {
    let world = World::new();
    world.update(0.016).unwrap();
    assert!(world.systems().get_failed_systems().is_empty());
}

// Property 1: recycled slots invalidate every older id.
#[test]
fn generation_recycling_invalidates_old_ids() {
    use rand::Rng;

    let world = World::new();
    let mut rng = rand::thread_rng();
    let mut live: Vec<Entity> = Vec::new();
    let mut dead: Vec<Entity> = Vec::new();

    for _ in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            live.push(world.create_entity());
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            world.destroy_entity(victim).unwrap();
            dead.push(victim);
        }
    }

    for &e in &dead {
        assert!(!world.is_entity_valid(e));
    }
    for &e in &live {
        assert!(world.is_entity_valid(e));
    }
    assert_eq!(world.entity_count(), live.len());
}

// Property 2: an add/remove pair restores has() and the total count.
#[test]
fn add_remove_pair_is_neutral() {
    use rand::Rng;

    let mut world = World::new();
    world.register::<Position>();
    let mut rng = rand::thread_rng();

    let entities: Vec<Entity> = (0..100).map(|_| world.create_entity()).collect();
    for &e in entities.iter().take(50) {
        world.add_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
    }

    for _ in 0..500 {
        let e = entities[rng.gen_range(0..entities.len())];
        let had = world.has_component::<Position>(e);
        let count = world.read_store::<Position>().unwrap().len();

        if had {
            world.remove_component::<Position>(e).unwrap();
            world.add_component(e, Position { x: 1.0, y: 1.0 }).unwrap();
        } else {
            world.add_component(e, Position { x: 1.0, y: 1.0 }).unwrap();
            world.remove_component::<Position>(e).unwrap();
        }

        assert_eq!(world.has_component::<Position>(e), had);
        assert_eq!(world.read_store::<Position>().unwrap().len(), count);
    }
}

// Property 7: pool accounting stays balanced against global usage.
#[test]
fn pool_accounting_balances() {
    let world = World::new();
    let memory = world.memory();
    memory.create_pool("particles", 64, 8).unwrap();
    let pool = memory.get_pool("particles").unwrap();

    let slots: Vec<_> = (0..20).map(|_| pool.acquire().unwrap()).collect();
    let usage = memory.get_memory_usage();
    let particles = &usage.pools["particles"];
    assert_eq!(particles.in_use, 20);
    assert!(
        (particles.in_use + particles.available) * 64 <= usage.allocated as usize,
        "pool slots cannot exceed cumulative allocation"
    );

    for slot in slots {
        pool.release(slot).unwrap();
    }
    let usage = memory.get_memory_usage();
    assert_eq!(usage.pools["particles"].in_use, 0);

    memory.destroy_pool("particles").unwrap();
    assert!(memory.get_pool("particles").is_err());
}

#[test]
fn movement_pipeline_end_to_end() {
    struct Movement;
    impl System for Movement {
        fn required_components(&self) -> Vec<TypeId> {
            vec![TypeId::of::<Position>(), TypeId::of::<Velocity>()]
        }
        fn thread_safety(&self) -> ThreadSafety {
            ThreadSafety::Full
        }
        fn update(&mut self, world: &World, dt: f32) -> Result<(), BoxedErr> {
            let mut positions = world.write_store::<Position>()?;
            let velocities = world.read_store::<Velocity>()?;
            for (entity, pos) in positions.iter_mut() {
                if let Some(vel) = velocities.get(entity) {
                    pos.x += vel.x * dt;
                    pos.y += vel.y * dt;
                }
            }
            Ok(())
        }
    }

    let mut world = World::new();
    world.register::<Position>();
    world.register::<Velocity>();
    world.systems().register(Movement).unwrap();

    let mover = world.create_entity();
    world
        .add_component(mover, Position { x: 0.0, y: 0.0 })
        .unwrap();
    world
        .add_component(mover, Velocity { x: 10.0, y: -5.0 })
        .unwrap();
    let still = world.create_entity();
    world
        .add_component(still, Position { x: 3.0, y: 3.0 })
        .unwrap();

    for _ in 0..10 {
        world.update(0.1).unwrap();
    }

    let positions = world.read_store::<Position>().unwrap();
    let moved = positions.get(mover).unwrap();
    assert!((moved.x - 10.0).abs() < 1e-4);
    assert!((moved.y + 5.0).abs() < 1e-4);
    assert_eq!(positions.get(still), Some(&Position { x: 3.0, y: 3.0 }));
}
