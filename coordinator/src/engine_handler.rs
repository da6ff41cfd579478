//! Per-coordinator registry of hypervisor clients, placement helpers, and
//! the setup/cleanup/restart worker pool (spec §4.3).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hypervisor_rpc::{wait_until_true, EngineClient, EngineRpcClient};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Engine, ReservationStatus, ResourceMap, Template, WorkstationStatus};
use crate::store::Store;

const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(5);
const IP_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Invoked with `true` on worker success, `false` on failure — the Rust
/// analogue of `utils/threading.py::ThreadWithCallback`'s completion hook.
pub type Callback = Box<dyn FnOnce(bool) -> BoxFuture + Send>;

fn spawn_with_callback<Fut>(fut: Fut, on_done: Callback) -> tokio::task::JoinHandle<()>
where
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::task::spawn(async move {
        let success = fut.await;
        on_done(success).await;
    })
}

struct SetupWorker {
    handle: tokio::task::JoinHandle<()>,
    vm_name: String,
}

/// Registry of hypervisor clients and live setup/cleanup workers.
pub struct EngineHandler {
    store: Arc<dyn Store>,
    clients: Mutex<HashMap<Uuid, Arc<dyn EngineClient>>>,
    setup_workers: Mutex<HashMap<Uuid, SetupWorker>>,
    cleanup_workers: Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

impl EngineHandler {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clients: Mutex::new(HashMap::new()),
            setup_workers: Mutex::new(HashMap::new()),
            cleanup_workers: Mutex::new(HashMap::new()),
        })
    }

    /// Lazily (re)constructs the RPC client for an engine on first use.
    pub async fn client_for_engine(&self, engine_id: Uuid) -> crate::error::Result<Arc<dyn EngineClient>> {
        if let Some(client) = self.clients.lock().await.get(&engine_id) {
            return Ok(Arc::clone(client));
        }

        let engine = self
            .store
            .get_engine(engine_id)
            .await
            .ok_or(crate::error::Error::Anomaly(engine_id))?;
        let host = self
            .store
            .host_for_engine(engine_id)
            .await
            .ok_or(crate::error::Error::Anomaly(engine_id))?;

        let client: Arc<dyn EngineClient> =
            Arc::new(EngineRpcClient::for_host(&host.ip_address, engine.port));
        self.clients.lock().await.insert(engine_id, Arc::clone(&client));
        Ok(client)
    }

    /// Registers a pre-built client for an engine, bypassing the lazy
    /// `EngineRpcClient` construction in [`Self::client_for_engine`] —
    /// the seam integration tests use to plug in a fake `EngineClient`.
    pub async fn register_client(&self, engine_id: Uuid, client: Arc<dyn EngineClient>) {
        self.clients.lock().await.insert(engine_id, client);
    }

    /// Eagerly constructs a client for every known engine so the first
    /// control-loop pass doesn't pay connection setup inline (spec §4.6
    /// `initialize_clients`); unreachable engines are logged and skipped,
    /// not fatal to startup.
    pub async fn initialize_clients(&self) {
        for engine in self.store.list_engines().await {
            if let Err(e) = self.client_for_engine(engine.id).await {
                warn!(engine = %engine.id, error = %e, "failed to initialize client for engine");
            }
        }
    }

    // ---- placement -----------------------------------------------------

    pub fn supported_engines_for_template<'a>(
        template: &Template,
        engines: &'a [Engine],
    ) -> Vec<&'a Engine> {
        engines
            .iter()
            .filter(|e| template.allowed_engine_types.contains(&e.engine_type))
            .collect()
    }

    /// Component-wise sum of `resource_requirements` for every reservation
    /// in `candidates` currently assigned to `engine_id` whose status is
    /// not in {Pending, Rejected, Completed, Cancelled} (spec §4.3).
    pub async fn aggregate_load(
        &self,
        engine_id: Uuid,
        candidates: &[crate::model::Reservation],
    ) -> ResourceMap {
        let mut load = ResourceMap::new();
        for r in candidates {
            if matches!(
                r.status,
                ReservationStatus::Pending
                    | ReservationStatus::Rejected
                    | ReservationStatus::Completed
                    | ReservationStatus::Cancelled
            ) {
                continue;
            }
            let Some(ws_id) = r.workstation else { continue };
            let Some(ws) = self.store.get_workstation(ws_id).await else { continue };
            if ws.engine != Some(engine_id) {
                continue;
            }
            let Some(template) = self.store.get_template(r.template).await else { continue };
            for (k, v) in &template.resource_requirements {
                *load.entry(k.clone()).or_insert(0) += v;
            }
        }
        load
    }

    /// `true` if adding `requirement` to `load` stays within `max`,
    /// component-wise over the keys present in `requirement` (per the
    /// design note: arithmetic is only ever done on that intersection).
    pub fn fits(load: &ResourceMap, requirement: &ResourceMap, max: &ResourceMap) -> bool {
        requirement
            .iter()
            .all(|(k, need)| load.get(k).copied().unwrap_or(0) + need <= max.get(k).copied().unwrap_or(0))
    }

    // ---- vm naming -------------------------------------------------------

    /// `Capitalize(username) + Capitalize(template.internal_name) +
    /// digits_only(request_date)`, matching the original character for
    /// character (spec §4.3).
    pub fn generate_vm_name(username: &str, template_internal_name: &str, request_date: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            capitalize_py(username),
            capitalize_py(template_internal_name),
            digits_only(&request_date.to_rfc3339())
        )
    }

    // ---- worker lifecycle ------------------------------------------------

    pub async fn is_setup_running(&self, reservation_id: Uuid) -> bool {
        self.setup_workers.lock().await.contains_key(&reservation_id)
    }

    pub async fn is_cleanup_running(&self, reservation_id: Uuid) -> bool {
        self.cleanup_workers.lock().await.contains_key(&reservation_id)
    }

    pub async fn gc_setup_workers(&self) {
        self.setup_workers
            .lock()
            .await
            .retain(|_, w| !w.handle.is_finished());
    }

    pub async fn gc_cleanup_workers(&self) {
        self.cleanup_workers
            .lock()
            .await
            .retain(|_, h| !h.is_finished());
    }

    pub async fn start_setup_worker(
        self: &Arc<Self>,
        reservation_id: Uuid,
        workstation_id: Uuid,
        engine_id: Uuid,
        template_internal_name: String,
        vm_name: String,
        on_done: Callback,
    ) -> crate::error::Result<()> {
        let client = self.client_for_engine(engine_id).await?;
        let store = Arc::clone(&self.store);
        let vm_name_for_registry = vm_name.clone();

        let fut = async move {
            let result = run_setup(&client, &store, workstation_id, &template_internal_name, &vm_name).await;
            match &result {
                Ok(()) => info!(reservation_id = %reservation_id, vm_name = %vm_name, "setup converged"),
                Err(e) => warn!(reservation_id = %reservation_id, vm_name = %vm_name, error = %e, "setup failed"),
            }
            result.is_ok()
        };

        let handle = spawn_with_callback(fut, on_done);
        self.setup_workers.lock().await.insert(
            reservation_id,
            SetupWorker {
                handle,
                vm_name: vm_name_for_registry,
            },
        );
        Ok(())
    }

    pub async fn start_cleanup_worker(
        &self,
        reservation_id: Uuid,
        engine_id: Uuid,
        vm_name: String,
        on_done: Callback,
    ) -> crate::error::Result<()> {
        let client = self.client_for_engine(engine_id).await?;

        let fut = async move {
            let result = client.delete_vm(&vm_name).await;
            match &result {
                Ok(msg) => info!(reservation_id = %reservation_id, vm_name = %vm_name, %msg, "cleanup converged"),
                Err(e) => warn!(reservation_id = %reservation_id, vm_name = %vm_name, error = %e, "cleanup failed"),
            }
            result.is_ok()
        };

        let handle = spawn_with_callback(fut, on_done);
        self.cleanup_workers.lock().await.insert(reservation_id, handle);
        Ok(())
    }

    pub async fn start_restart_worker(
        &self,
        reservation_id: Uuid,
        engine_id: Uuid,
        vm_name: String,
        on_done: Callback,
    ) -> crate::error::Result<()> {
        let client = self.client_for_engine(engine_id).await?;
        let vm_name_for_registry = vm_name.clone();

        let fut = async move {
            let result = run_restart(&client, &vm_name).await;
            match &result {
                Ok(()) => info!(reservation_id = %reservation_id, vm_name = %vm_name, "restart converged"),
                Err(e) => warn!(reservation_id = %reservation_id, vm_name = %vm_name, error = %e, "restart failed"),
            }
            result.is_ok()
        };

        let handle = spawn_with_callback(fut, on_done);
        // Restart workers share the setup registry so a pending setup and a
        // restart for the same reservation can never both be in flight,
        // mirroring `self.setup_threads.get(reservation.id)` in the original.
        self.setup_workers.lock().await.insert(
            reservation_id,
            SetupWorker {
                handle,
                vm_name: vm_name_for_registry,
            },
        );
        Ok(())
    }

    /// Deletes any VM on any engine that isn't accounted for by a live
    /// setup target or a consistent DB reference (spec §4.3).
    pub async fn clean_orphaned_workstations(&self) {
        let engines = self.store.list_engines().await;
        let workstations = self.store.list_workstations().await;
        let reservations = self.store.list_reservations().await;

        let setup_targets: HashSet<String> = self
            .setup_workers
            .lock()
            .await
            .values()
            .map(|w| w.vm_name.clone())
            .collect();

        for engine in engines {
            let client = match self.client_for_engine(engine.id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(engine = %engine.id, error = %e, "skipping orphan sweep for unreachable engine");
                    continue;
                }
            };
            let names = match client.get_all_vm_names().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(engine = %engine.id, error = %e, "failed to list VMs during orphan sweep");
                    continue;
                }
            };

            for name in names {
                if setup_targets.contains(&name) {
                    continue;
                }

                let ws = workstations
                    .iter()
                    .find(|w| w.engine_internal_name.as_deref() == Some(name.as_str()));

                let should_delete = match ws {
                    None => true,
                    Some(ws) => {
                        let res = reservations.iter().find(|r| r.workstation == Some(ws.id));
                        match res {
                            None => true,
                            Some(r) => {
                                !matches!(r.status, ReservationStatus::Approved | ReservationStatus::Active)
                                    || !matches!(
                                        ws.status,
                                        WorkstationStatus::Active
                                            | WorkstationStatus::Setup
                                            | WorkstationStatus::Cleanup
                                            | WorkstationStatus::Restart
                                    )
                            }
                        }
                    }
                };

                if should_delete {
                    info!(vm_name = %name, engine = %engine.id, "deleting orphaned VM");
                    if let Err(e) = client.delete_vm(&name).await {
                        warn!(vm_name = %name, error = %e, "failed to delete orphaned VM");
                    }
                }
            }
        }
    }
}

async fn run_setup(
    client: &Arc<dyn EngineClient>,
    store: &Arc<dyn Store>,
    workstation_id: Uuid,
    template_internal_name: &str,
    vm_name: &str,
) -> hypervisor_rpc::Result<()> {
    if client.vm_exists(vm_name).await? {
        client.delete_vm(vm_name).await?;
    }
    client.create_vm(template_internal_name, vm_name).await?;
    client.start_vm(vm_name).await?;

    wait_until_true(
        &format!("VM {vm_name} to start running"),
        None,
        RUNNING_POLL_INTERVAL,
        || async { client.is_vm_running(vm_name).await },
    )
    .await?;

    wait_until_true(
        &format!("guest agent on {vm_name} to become reachable"),
        None,
        RUNNING_POLL_INTERVAL,
        || async { client.is_agent_running(vm_name).await },
    )
    .await?;

    let network = loop {
        let info = client.get_vm_network_info(vm_name).await?;
        if !info.is_apipa() {
            break info;
        }
        tokio::time::sleep(IP_POLL_INTERVAL).await;
    };

    // Port 5900 is the default VNC port mappings resolve to; the setup
    // worker is the first writer of a workstation's reachable address.
    store
        .set_workstation_network(workstation_id, network.ip_address, 5900, vm_name.to_string())
        .await;
    Ok(())
}

async fn run_restart(client: &Arc<dyn EngineClient>, vm_name: &str) -> hypervisor_rpc::Result<()> {
    client.reboot_vm(vm_name).await?;
    wait_until_true(
        &format!("guest agent on {vm_name} to become reachable after restart"),
        None,
        RUNNING_POLL_INTERVAL,
        || async { client.is_agent_running(vm_name).await },
    )
    .await
}

/// Uppercases only the first character, lowercasing the remainder —
/// Python's `str.capitalize()`, ported faithfully rather than the more
/// obvious "uppercase first char, leave the rest" Rust idiom.
fn capitalize_py(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn capitalize_matches_python_semantics() {
        assert_eq!(capitalize_py("ALICE"), "Alice");
        assert_eq!(capitalize_py("bob"), "Bob");
        assert_eq!(capitalize_py(""), "");
    }

    #[test]
    fn digits_only_strips_everything_else() {
        assert_eq!(digits_only("2026-07-27T10:30:00+00:00"), "202607271030000000");
    }

    #[test]
    fn vm_name_is_deterministic_per_reservation() {
        let date = Utc.with_ymd_and_hms(2026, 7, 27, 10, 30, 0).unwrap();
        let a = EngineHandler::generate_vm_name("alice", "win10-template", date);
        let b = EngineHandler::generate_vm_name("alice", "win10-template", date);
        assert_eq!(a, b);
        assert!(a.starts_with("AliceWin10-template"));
    }

    #[test]
    fn fits_checks_only_requirement_keys() {
        let mut load = ResourceMap::new();
        load.insert("cpu".to_string(), 4);
        let mut requirement = ResourceMap::new();
        requirement.insert("cpu".to_string(), 4);
        let mut max = ResourceMap::new();
        max.insert("cpu".to_string(), 8);
        max.insert("ram".to_string(), 16);

        assert!(EngineHandler::fits(&load, &requirement, &max));

        requirement.insert("cpu".to_string(), 5);
        assert!(!EngineHandler::fits(&load, &requirement, &max));
    }
}
