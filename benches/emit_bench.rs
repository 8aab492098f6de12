use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pulse_ecs::prelude::*;

#[derive(Debug, Default, Clone)]
struct Velocity {
    x: i32,
    y: i32,
}

fn bench_add_no_observers(c: &mut Criterion) {
    c.bench_function("add_1000_no_observers", |b| {
        b.iter(|| {
            let mut world = World::new();
            for i in 0..1000 {
                let e = world.spawn();
                world.set(e, Velocity { x: i, y: i }).unwrap();
                black_box(e);
            }
        })
    });
}

fn bench_add_with_observer(c: &mut Criterion) {
    c.bench_function("add_1000_with_on_add_observer", |b| {
        b.iter(|| {
            let mut world = World::new();
            let v = world.component_id::<Velocity>();
            world.observe(ON_ADD, v, |view| {
                black_box(view.count);
            });
            for i in 0..1000 {
                let e = world.spawn();
                world.set(e, Velocity { x: i, y: i }).unwrap();
            }
        })
    });
}

fn bench_inheritance_forwarding(c: &mut Criterion) {
    c.bench_function("instantiate_1000_from_base", |b| {
        b.iter(|| {
            let mut world = World::new();
            let v = world.component_id::<Velocity>();
            world.observe(ON_SET, v, |view| {
                black_box(view.source);
            });
            let base = world.spawn();
            world.set(base, Velocity { x: 1, y: 2 }).unwrap();
            for _ in 0..1000 {
                let inst = world.spawn();
                world.add_pair(inst, IS_A, base).unwrap();
            }
        })
    });
}

fn bench_propagation_fanout(c: &mut Criterion) {
    c.bench_function("propagate_to_100_instances", |b| {
        let mut world = World::new();
        let v = world.component_id::<Velocity>();
        world.observe(ON_SET, v, |view| {
            black_box(view.count);
        });
        let base = world.spawn();
        world.set(base, Velocity { x: 1, y: 2 }).unwrap();
        for _ in 0..100 {
            let inst = world.spawn();
            world.add_pair(inst, IS_A, base).unwrap();
        }
        let mut i = 0;
        b.iter(|| {
            i += 1;
            world.set(base, Velocity { x: i, y: i }).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_add_no_observers,
    bench_add_with_observer,
    bench_inheritance_forwarding,
    bench_propagation_fanout
);
criterion_main!(benches);
