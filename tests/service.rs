use glam::{Quat, Vec3};
use spatialsrv::service::CellDescriptor;
use spatialsrv::txn::{DataStore, TransactionScheduler};
use spatialsrv::types::*;
use spatialsrv::universe::{CacheUpdate, TransformChangeListener};
use spatialsrv::{Config, Error, UniverseManager, UniverseService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn at(x: f32) -> CellTransform {
    CellTransform::from_translation(Vec3::new(x, 0.0, 0.0))
}

fn start() -> UniverseService {
    let config = Config { view_radius: 20.0, ..Config::default() };
    UniverseService::new(config, Arc::new(TransactionScheduler::new(64)), DataStore::in_memory()).unwrap()
}

fn run<T>(service: &UniverseService, owner: &str, task: impl FnMut(&mut spatialsrv::txn::Transaction) -> spatialsrv::Result<T>) -> T {
    service.scheduler().run_task(&Identity::new(owner), "test", task).unwrap()
}

fn cell(id: u64, x: f32) -> CellDescriptor {
    CellDescriptor::new(CellId(id), CellClass::Basic)
        .with_transform(at(x))
        .with_bounds(Bounds::sphere(Vec3::ZERO, 0.5))
}

#[test]
fn translate_example() {
    let service = start();
    let (a, b) = (cell(1, 0.0), cell(2, 1.0));
    run(&service, "builder", |txn| {
        service.create_cell(txn, &a)?;
        service.add_root_to_universe(txn, a.id)?;
        service.create_cell(txn, &b)?;
        service.add_child(txn, a.id, b.id)
    });
    service.wait_for_changes();
    assert_eq!(service.get_world_transform(b.id), Some(at(1.0)));

    run(&service, "builder", |txn| service.set_local_transform(txn, a.id, at(5.0)));
    service.wait_for_changes();
    assert_eq!(service.get_world_transform(b.id), Some(at(6.0)));
    service.shutdown();
}

#[test]
fn creating_a_cell_twice_keeps_the_first() {
    let service = start();
    let first = cell(1, 3.0);
    run(&service, "builder", |txn| {
        service.create_cell(txn, &first)?;
        service.add_root_to_universe(txn, first.id)
    });
    run(&service, "intruder", |txn| {
        service.create_cell(txn, &cell(1, 99.0).with_bounds(Bounds::sphere(Vec3::ZERO, 50.0)))
    });
    service.wait_for_changes();
    assert_eq!(service.get_world_transform(first.id), Some(at(3.0)));
    let bounds = service.get_world_bounds(first.id).unwrap();
    assert_eq!(bounds, Bounds::sphere(Vec3::ZERO, 0.5).transformed(&at(3.0)));
    service.shutdown();
}

#[test]
fn world_transforms_compose_down_the_tree() {
    let service = start();
    let reader = service.reader();
    let spin = Quat::from_rotation_y(0.7);
    run(&service, "builder", |txn| {
        for id in 1..=6 {
            let local = at(id as f32).with_rotation(spin).with_scale(1.0 + id as f32 * 0.1);
            service.create_cell(txn, &cell(id, 0.0).with_transform(local))?;
        }
        service.add_root_to_universe(txn, CellId(1))?;
        service.add_root_to_universe(txn, CellId(4))?;
        service.add_child(txn, CellId(1), CellId(2))?;
        service.add_child(txn, CellId(2), CellId(3))?;
        service.add_child(txn, CellId(3), CellId(4))?;
        service.add_child(txn, CellId(1), CellId(5))?;
        service.add_child(txn, CellId(5), CellId(6))
    });
    run(&service, "mover", |txn| {
        service.set_local_transform(txn, CellId(1), at(-3.0).with_rotation(Quat::from_rotation_z(1.1)))?;
        service.set_local_transform(txn, CellId(3), at(2.0).with_scale(0.5))
    });
    service.wait_for_changes();

    assert_eq!(reader.roots(), vec![CellId(1)]);
    for root in reader.roots() {
        assert_eq!(reader.world_transform(root), reader.local_transform(root));
    }
    for id in 2..=6 {
        let id = CellId(id);
        let parent = reader.parent(id).unwrap();
        let expected = reader.world_transform(parent).unwrap().mul(&reader.local_transform(id).unwrap());
        let world = reader.world_transform(id).unwrap();
        assert!(world.approx_eq(&expected, 1e-4), "{id}: {world:?} != {expected:?}");
    }
    service.shutdown();
}

#[test]
fn last_committed_transaction_wins() {
    let service = Arc::new(start());
    let target = cell(1, 0.0);
    run(&service, "builder", |txn| {
        service.create_cell(txn, &target)?;
        service.add_root_to_universe(txn, target.id)
    });

    // the shared counter makes commit order and sequence order the same
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let service = service.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    run(&service, &format!("writer{t}"), |txn| {
                        let seq = service.store().next_id(txn, "test.seq")?;
                        service.set_local_transform(txn, target.id, at(seq as f32))
                    });
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    service.wait_for_changes();
    assert_eq!(service.get_world_transform(target.id), Some(at(40.0)));
    service.shutdown();
}

#[derive(Default)]
struct Seen(Mutex<Vec<f32>>);
impl TransformChangeListener for Seen {
    fn transform_changed(&self, _cell: CellId, _local: &CellTransform, world: &CellTransform, _identity: &Identity) {
        self.0.lock().unwrap().push(world.translation.x);
    }
}

#[test]
fn aborted_changes_are_never_applied() {
    let service = Arc::new(start());
    let target = cell(1, 0.0);
    let seen = Arc::new(Seen::default());
    run(&service, "builder", |txn| {
        service.create_cell(txn, &target)?;
        service.add_root_to_universe(txn, target.id)?;
        service.add_transform_change_listener(txn, target.id, seen.clone())
    });

    let aborter = {
        let service = service.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                let result: spatialsrv::Result<()> =
                    service.scheduler().run_task(&Identity::new("aborter"), "abort", |txn| {
                        service.set_local_transform(txn, target.id, at(-1.0))?;
                        Err(Error::aborted("changed my mind"))
                    });
                assert!(result.is_err());
            }
        })
    };
    for i in 1..=50 {
        run(&service, "mover", |txn| service.set_local_transform(txn, target.id, at(i as f32)));
    }
    aborter.join().unwrap();
    service.wait_for_changes();

    let seen = seen.0.lock().unwrap();
    assert!(!seen.contains(&-1.0));
    assert_eq!(seen.last(), Some(&50.0));
    service.shutdown();
}

#[test]
fn readers_never_see_half_a_cascade() {
    const DEPTH: u64 = 20;
    let service = Arc::new(start());
    let reader = service.reader();
    run(&service, "builder", |txn| {
        service.create_cell(txn, &cell(1, 0.0))?;
        for id in 2..=DEPTH {
            service.create_cell(txn, &cell(id, 1.0))?;
            service.add_child(txn, CellId(id - 1), CellId(id))?;
        }
        service.add_root_to_universe(txn, CellId(1))
    });
    service.wait_for_changes();

    let done = Arc::new(AtomicBool::new(false));
    let checker = {
        let done = done.clone();
        std::thread::spawn(move || {
            let mut checked = 0;
            while !done.load(Ordering::Relaxed) || checked == 0 {
                let snapshot = reader.graph_snapshot(CellId(DEPTH));
                assert_eq!(snapshot.len(), DEPTH as usize);
                let base = snapshot[0].1.unwrap().translation.x;
                for (depth, (id, world)) in snapshot.iter().enumerate() {
                    let x = world.unwrap().translation.x;
                    assert!((x - base - depth as f32).abs() < 1e-3, "{id} at {x} in a root at {base}");
                }
                checked += 1;
            }
            checked
        })
    };
    for step in 0..200 {
        run(&service, "mover", |txn| service.set_local_transform(txn, CellId(1), at(step as f32 * 3.0)));
    }
    service.wait_for_changes();
    done.store(true, Ordering::Relaxed);
    assert!(checker.join().unwrap() > 0);
    service.shutdown();
}

#[test]
fn views_follow_the_world() {
    let service = start();
    let reader = service.reader();
    let avatar = CellDescriptor::new(CellId(100), CellClass::View);
    run(&service, "builder", |txn| {
        service.create_cell(txn, &cell(1, 5.0))?;
        service.create_cell(txn, &cell(2, 500.0))?;
        service.create_cell(txn, &avatar)?;
        for id in [1, 2, 100] {
            service.add_root_to_universe(txn, CellId(id))?;
        }
        Ok(())
    });
    run(&service, "alice", |txn| service.view_login(txn, avatar.id, PersistentRef(7)));
    service.wait_for_changes();
    let updates = reader.take_cache_updates(avatar.id);
    assert!(updates.contains(&CacheUpdate::RootAdded(CellId(1))));
    assert!(!updates.contains(&CacheUpdate::RootAdded(CellId(2))));

    run(&service, "alice", |txn| service.set_local_transform(txn, avatar.id, at(495.0)));
    service.wait_for_changes();
    let updates = reader.take_cache_updates(avatar.id);
    assert!(updates.contains(&CacheUpdate::RootRemoved(CellId(1))));
    assert!(updates.contains(&CacheUpdate::RootAdded(CellId(2))));

    run(&service, "alice", |txn| service.view_logout(txn, avatar.id));
    service.wait_for_changes();
    assert!(!reader.is_logged_in(avatar.id));
    service.shutdown();
}
