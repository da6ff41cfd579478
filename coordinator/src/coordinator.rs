//! Singleton control loop (spec §4.6), ported from
//! `workstation_coordinator/coordinator.py`'s `metaclass=Singleton` class.
//!
//! Rust has no metaclasses, so the singleton is a `OnceLock<Arc<Coordinator>>`:
//! the first caller to reach [`Coordinator::instance`] wins and every
//! later call returns the same instance, matching the original's "first
//! construction in the process wins" semantics.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::engine_handler::EngineHandler;
use crate::model::ReservationStatus;
use crate::reservation_handler::ReservationHandler;
use crate::store::Store;

const LOOP_INTERVAL: Duration = Duration::from_secs(5);

static INSTANCE: OnceLock<Arc<Coordinator>> = OnceLock::new();

pub struct Coordinator {
    store: Arc<dyn Store>,
    pub engines: Arc<EngineHandler>,
    pub reservations: Arc<ReservationHandler>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    fn new(store: Arc<dyn Store>) -> Self {
        let engines = EngineHandler::new(Arc::clone(&store));
        let reservations = Arc::new(ReservationHandler::new(Arc::clone(&store), Arc::clone(&engines)));
        Self {
            store,
            engines,
            reservations,
            thread: Mutex::new(None),
        }
    }

    /// Returns the process-wide instance, constructing it against `store`
    /// the first time it's called. `store` is ignored on every later call,
    /// exactly as a Python singleton's `__init__` only runs once.
    pub fn instance(store: Arc<dyn Store>) -> Arc<Coordinator> {
        Arc::clone(INSTANCE.get_or_init(|| Arc::new(Coordinator::new(store))))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn is_active(&self) -> bool {
        match self.thread.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    /// Spawns the background control loop. A second call while the first
    /// is still alive is a no-op (spec §4.6 `start()`).
    pub async fn start(self: &Arc<Self>) {
        if self.is_active().await {
            info!("coordinator is already active, skipping startup");
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::task::spawn(async move {
            this.main_loop().await;
        });
        *self.thread.lock().await = Some(handle);
    }

    /// One-shot diagnostic dump of the things an operator would want to
    /// see right after startup (spec §4.6 `_list_info`).
    async fn list_info(&self) {
        info!("listing all engine types");
        for engine_type in self.store.list_engine_types().await {
            info!(engine_type = %engine_type.name, "engine type");
        }

        info!("listing all templates");
        for template in self.store.list_templates().await {
            info!(template = %template.name, internal_name = %template.internal_name, "template");
        }

        let pending = self
            .store
            .list_reservations()
            .await
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Pending)
            .count();
        info!(pending, "checking for pending reservations");
    }

    async fn main_loop(&self) {
        self.engines.initialize_clients().await;
        self.list_info().await;
        tokio::time::sleep(LOOP_INTERVAL).await;

        loop {
            self.reservations.handle().await;
            self.engines.gc_setup_workers().await;
            self.engines.gc_cleanup_workers().await;
            self.engines.clean_orphaned_workstations().await;
            tokio::time::sleep(LOOP_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn is_active_is_false_before_start() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(store);
        assert!(!coordinator.is_active().await);
    }
}
