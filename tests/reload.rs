use glam::Vec3;
use spatialsrv::persistence::{CellPersistence, CellRecord, StoredCells};
use spatialsrv::reload::{ReloadDriver, ReloadState, ReloadSummary, ROOTS_ITERATOR};
use spatialsrv::txn::{DataStore, TransactionScheduler};
use spatialsrv::types::*;
use spatialsrv::{Config, UniverseService};
use std::collections::BTreeSet;
use std::sync::Arc;

const ROOTS: u64 = 12;

fn at(x: f32) -> CellTransform {
    CellTransform::from_translation(Vec3::new(x, 0.0, 0.0))
}

/// Roots 10, 20, .., each with one child at +1 and a grandchild at +2.
fn seed(store: &DataStore) {
    let cells = StoredCells::new(store.clone());
    let bounds = Bounds::sphere(Vec3::ZERO, 0.5);
    TransactionScheduler::new(1)
        .run_task(&Identity::system(), "seed", |txn| {
            for n in 1..=ROOTS {
                let root = CellId(n * 10);
                let child = CellId(n * 10 + 1);
                let grandchild = CellId(n * 10 + 2);
                let mut record = CellRecord::new(root, at(n as f32 * 100.0), bounds);
                record.children.push(child);
                cells.save_cell(txn, &record)?;
                let mut record = CellRecord::new(child, at(1.0), bounds);
                record.children.push(grandchild);
                cells.save_cell(txn, &record)?;
                cells.save_cell(txn, &CellRecord::new(grandchild, at(1.0), bounds))?;
                cells.save_root(txn, root)?;
            }
            Ok(())
        })
        .unwrap();
}

fn start(store: &DataStore) -> UniverseService {
    let config = Config { cell_load_count: 5, ..Config::default() };
    UniverseService::new(config, Arc::new(TransactionScheduler::new(8)), store.clone()).unwrap()
}

#[test]
fn reload_rebuilds_every_root() {
    let store = DataStore::in_memory();
    seed(&store);
    let service = start(&store);
    let summary = service.ready(&StoredCells::new(store.clone())).unwrap();
    assert_eq!(summary, ReloadSummary { added: ROOTS as usize, errors: 0 });
    service.wait_for_changes();

    let reader = service.reader();
    assert_eq!(reader.roots().len(), ROOTS as usize);
    assert_eq!(reader.cell_count(), 3 * ROOTS as usize);
    assert_eq!(reader.world_transform(CellId(72)), Some(at(702.0)));
    assert_eq!(store.committed::<ReloadState>(ROOTS_ITERATOR).unwrap(), None);
    service.shutdown();
}

#[test]
fn a_restart_reloads_everything_despite_a_stale_cursor() {
    let store = DataStore::in_memory();
    seed(&store);
    let cells = StoredCells::new(store.clone());

    let first = start(&store);
    let driver = ReloadDriver::new(&first, &cells);
    let state = driver.start().unwrap();
    assert_eq!(state, ReloadState { after: None, total: ROOTS as usize });
    let step = driver.step().unwrap();
    assert_eq!(step.summary.added, 5);
    assert!(!step.finished);
    driver.step().unwrap();
    let cursor: ReloadState = store.committed(ROOTS_ITERATOR).unwrap().unwrap();
    assert_eq!(cursor.after, Some(CellId(100)));
    first.wait_for_changes();
    first.shutdown();

    // a fresh process over the same store starts with an empty universe
    let second = start(&store);
    let summary = second.ready(&cells).unwrap();
    assert_eq!(summary, ReloadSummary { added: ROOTS as usize, errors: 0 });
    second.wait_for_changes();
    let reader = second.reader();
    let roots: BTreeSet<CellId> = reader.roots().into_iter().collect();
    let expected = TransactionScheduler::new(1)
        .run_task(&Identity::system(), "roots", |txn| cells.root_cell_ids(txn))
        .unwrap();
    assert_eq!(roots, expected);
    assert_eq!(reader.cell_count(), 3 * ROOTS as usize);
    assert_eq!(reader.world_transform(CellId(12)), Some(at(102.0)));
    assert_eq!(store.committed::<ReloadState>(ROOTS_ITERATOR).unwrap(), None);
    second.shutdown();
}

#[test]
fn an_interrupted_reload_continues_in_the_same_process() {
    let store = DataStore::in_memory();
    seed(&store);
    let cells = StoredCells::new(store.clone());
    let service = start(&store);

    let driver = ReloadDriver::new(&service, &cells);
    driver.start().unwrap();
    let first = driver.step().unwrap();
    assert_eq!(first.summary, ReloadSummary { added: 5, errors: 0 });
    drop(driver);

    let driver = ReloadDriver::new(&service, &cells);
    assert_eq!(driver.resume().unwrap().after, Some(CellId(50)));
    let rest = driver.finish().unwrap();
    assert_eq!(rest, ReloadSummary { added: ROOTS as usize - 5, errors: 0 });
    service.wait_for_changes();

    let reader = service.reader();
    assert_eq!(reader.roots().len(), ROOTS as usize);
    assert_eq!(reader.cell_count(), 3 * ROOTS as usize);
    assert_eq!(store.committed::<ReloadState>(ROOTS_ITERATOR).unwrap(), None);
    service.shutdown();
}

#[test]
fn missing_records_are_counted_not_fatal() {
    let store = DataStore::in_memory();
    seed(&store);
    let cells = StoredCells::new(store.clone());
    TransactionScheduler::new(1)
        .run_task(&Identity::system(), "orphan", |txn| {
            cells.save_root(txn, CellId(5))?;
            cells.forget_cell(txn, CellId(31)).map(|_| ())
        })
        .unwrap();

    let service = start(&store);
    let summary = service.ready(&cells).unwrap();
    assert_eq!(summary, ReloadSummary { added: ROOTS as usize, errors: 1 });
    service.wait_for_changes();
    let reader = service.reader();
    assert!(!reader.contains(CellId(5)));
    // the root whose child went missing still comes back, just smaller
    assert!(reader.children(CellId(30)).is_empty());
    service.shutdown();
}

#[test]
fn reload_from_a_level_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("universe.nbt");
    seed(&DataStore::open(&path).unwrap());

    let store = DataStore::open(&path).unwrap();
    let service = start(&store);
    let summary = service.ready(&StoredCells::new(store.clone())).unwrap();
    assert_eq!(summary.added, ROOTS as usize);
    service.wait_for_changes();
    assert_eq!(service.reader().world_transform(CellId(11)), Some(at(101.0)));
    service.shutdown();
}

#[test]
fn nothing_to_reload() {
    let store = DataStore::in_memory();
    let service = start(&store);
    assert_eq!(service.ready(&StoredCells::new(store.clone())).unwrap(), ReloadSummary::default());
    service.shutdown();
}
