use spatialsrv::persistence::StoredCells;
use spatialsrv::txn::{DataStore, TransactionScheduler};
use spatialsrv::{Config, UniverseService};
use std::sync::Arc;

fn main() -> spatialsrv::Result<()> {
    env_logger::init();
    let mut args = std::env::args_os().skip(1);

    let store = match args.next() {
        Some(path) => DataStore::open(path)?,
        None => {
            log::warn!("no level file given, nothing will be kept");
            DataStore::in_memory()
        }
    };
    let config = match args.next() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = config.with_overrides(|key| std::env::var(key).ok())?;
    log::info!("{config:?}");

    let scheduler = Arc::new(TransactionScheduler::new(config.max_retries));
    let service = match UniverseService::new(config, scheduler, store.clone()) {
        Ok(service) => service,
        Err(e) => {
            log::error!("universe service failed to start: {e}");
            return Err(e);
        }
    };

    let summary = service.ready(&StoredCells::new(store))?;
    service.wait_for_changes();

    let reader = service.reader();
    for root in reader.roots() {
        match reader.world_bounds(root) {
            Some(bounds) => log::info!("{root} spans {bounds:?} with {} cells", reader.graph_snapshot(root).len()),
            None => log::warn!("{root} has no world bounds"),
        }
    }
    log::info!("{} roots up, {} failed to load", summary.added, summary.errors);

    service.shutdown();
    Ok(())
}
