//! End-to-end scenarios exercising storage, forwarding and propagation
//! through the public API.

use pulse_ecs::prelude::*;
use pulse_ecs::AnyVec;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default, Clone, PartialEq)]
struct Health(i32);

#[derive(Debug, Default, Clone, PartialEq)]
struct Armor(i32);

#[test]
fn deep_inheritance_chain_resolves_nearest_value() {
    let mut world = World::new();

    // Chain of 30 entities, the root owns Health; a single override sits
    // in the middle.
    let root = world.spawn();
    world.set(root, Health(1)).unwrap();
    let mut prev = root;
    let mut middle = root;
    for i in 1..30 {
        let next = world.spawn();
        world.add_pair(next, IS_A, prev).unwrap();
        if i == 15 {
            world.set(next, Health(999)).unwrap();
            middle = next;
        }
        prev = next;
    }

    let h = world.component_id::<Health>();
    let hits: Rc<RefCell<Vec<(Option<Entity>, Health)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = hits.clone();
    world.observe(ON_SET, h, move |view| {
        sink.borrow_mut()
            .push((view.source, view.value::<Health>().cloned().unwrap()));
    });

    let inst = world.spawn();
    world.add_pair(inst, IS_A, prev).unwrap();

    let hits = hits.borrow();
    assert_eq!(hits.len(), 1);
    // The override in the middle of the chain shadows the root's value.
    assert_eq!(hits[0], (Some(middle), Health(999)));
}

#[test]
fn cache_reuse_across_many_instances() {
    let mut world = World::new();
    let base = world.spawn();
    world.set(base, Health(10)).unwrap();
    world.set(base, Armor(5)).unwrap();

    let h = world.component_id::<Health>();
    let count = Rc::new(RefCell::new(0usize));
    let sink = count.clone();
    world.observe(ON_SET, h, move |_| {
        *sink.borrow_mut() += 1;
    });

    for _ in 0..100 {
        let inst = world.spawn();
        world.add_pair(inst, IS_A, base).unwrap();
    }
    // One forwarded OnSet per instance, all but the first served from the
    // reachability cache.
    assert_eq!(*count.borrow(), 100);

    let cache = &world
        .component_record(Id::pair(IS_A, base))
        .unwrap()
        .pair
        .as_ref()
        .unwrap()
        .reachable;
    assert!(cache.is_valid());
    assert_eq!(cache.ids.len(), 2);
}

#[test]
fn mutation_of_shared_base_notifies_every_instance() {
    let mut world = World::new();
    let base = world.spawn();
    world.set(base, Health(10)).unwrap();

    let mut instances = Vec::new();
    for _ in 0..10 {
        let inst = world.spawn();
        world.add_pair(inst, IS_A, base).unwrap();
        instances.push(inst);
    }

    let h = world.component_id::<Health>();
    let notified: Rc<RefCell<Vec<Entity>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = notified.clone();
    world.observe(ON_SET, h, move |view| {
        sink.borrow_mut().extend_from_slice(view.entities);
    });

    world.set(base, Health(20)).unwrap();

    let notified = notified.borrow();
    assert!(notified.contains(&base));
    for inst in &instances {
        assert!(notified.contains(inst), "instance not notified: {inst:?}");
    }
}

#[test]
fn remove_and_readd_keeps_events_consistent() {
    let mut world = World::new();
    let h = world.component_id::<Health>();

    let events: Rc<RefCell<Vec<Entity>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    world.observe(WILDCARD, h, move |view| {
        sink.borrow_mut().push(view.event);
    });

    let e = world.spawn();
    world.set(e, Health(1)).unwrap();
    world.remove::<Health>(e).unwrap();
    world.set(e, Health(2)).unwrap();

    assert_eq!(
        events.borrow().as_slice(),
        &[ON_ADD, ON_SET, ON_REMOVE, ON_ADD, ON_SET]
    );
    assert_eq!(world.get::<Health>(e), Some(&Health(2)));
}

#[test]
fn unregistering_an_observer_stops_dispatch() {
    let mut world = World::new();
    let h = world.component_id::<Health>();
    let count = Rc::new(RefCell::new(0usize));
    let sink = count.clone();
    let handle = world.observe(ON_SET, h, move |_| {
        *sink.borrow_mut() += 1;
    });

    let e = world.spawn();
    world.set(e, Health(1)).unwrap();
    assert_eq!(*count.borrow(), 1);

    world.unobserve(handle);
    world.set(e, Health(2)).unwrap();
    assert_eq!(*count.borrow(), 1);
    assert!(!world.observers_exist(h, ON_SET));
}

#[test]
fn wildcard_pair_observers_match_concrete_pairs() {
    let mut world = World::new();
    let likes = world.tag();
    let alice = world.spawn();
    let bob = world.spawn();

    let matched: Rc<RefCell<Vec<Id>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = matched.clone();
    world.observe(ON_ADD, Id::pair(likes, WILDCARD), move |view| {
        sink.borrow_mut().push(view.event_id);
    });
    let sink = matched.clone();
    world.observe(ON_ADD, Id::pair(WILDCARD, bob), move |view| {
        sink.borrow_mut().push(view.event_id);
    });

    let e = world.spawn();
    world.add_pair(e, likes, alice).unwrap();
    world.add_pair(e, likes, bob).unwrap();

    // (likes, alice) matches only (likes, *); (likes, bob) matches both.
    assert_eq!(
        matched.borrow().as_slice(),
        &[
            Id::pair(likes, alice),
            Id::pair(likes, bob),
            Id::pair(likes, bob)
        ]
    );
}

#[test]
fn grow_buffer_keeps_values_stable() {
    // Growable-buffer scenario: append 1000 elements one at a time and
    // verify nothing is corrupted by reallocation.
    let elem = std::mem::size_of::<i32>();
    let align = std::mem::align_of::<i32>();
    let mut buf = AnyVec::new(elem, align);
    for i in 0..1000i32 {
        let slot = buf.append(elem);
        unsafe { (slot as *mut i32).write(i) };
        assert!(buf.capacity().is_power_of_two());
        assert!(buf.capacity() >= buf.count());
        for j in 0..=i {
            let read = unsafe { *(buf.get(elem, j as usize) as *const i32) };
            assert_eq!(read, j);
        }
    }
    assert_eq!(buf.count(), 1000);
}
