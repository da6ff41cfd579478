//! End-to-end scenarios from spec §8, driven against `MemoryStore` and a
//! fake `EngineClient` so the reservation/engine handlers are exercised
//! without a network, the way the teacher's integration suites fake out
//! their remote dependencies.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use coordinator::engine_handler::EngineHandler;
use coordinator::model::{Engine, Host, ReservationStatus, ResourceMap, Template, Workstation, WorkstationStatus};
use coordinator::reservation_handler::ReservationHandler;
use coordinator::store::{MemoryStore, Store};
use hypervisor_rpc::{EngineClient, NetworkInfo};
use serde_json::Value;
use uuid::Uuid;

/// A scriptable `EngineClient` double: VMs "exist" once created, "run"
/// once started, and `get_vm_network_info` replays a fixed sequence of
/// responses (used to drive the APIPA hold-off scenario).
struct FakeEngineClient {
    vms: tokio::sync::Mutex<HashSet<String>>,
    running: tokio::sync::Mutex<HashSet<String>>,
    network_script: tokio::sync::Mutex<Vec<NetworkInfo>>,
    network_calls: AtomicUsize,
}

impl FakeEngineClient {
    fn new(network_script: Vec<NetworkInfo>) -> Self {
        Self {
            vms: tokio::sync::Mutex::new(HashSet::new()),
            running: tokio::sync::Mutex::new(HashSet::new()),
            network_script: tokio::sync::Mutex::new(network_script),
            network_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EngineClient for FakeEngineClient {
    async fn start_vm(&self, name: &str) -> hypervisor_rpc::Result<String> {
        self.running.lock().await.insert(name.to_string());
        Ok("started".to_string())
    }

    async fn stop_vm(&self, name: &str) -> hypervisor_rpc::Result<String> {
        self.running.lock().await.remove(name);
        Ok("stopped".to_string())
    }

    async fn reboot_vm(&self, _name: &str) -> hypervisor_rpc::Result<String> {
        Ok("rebooted".to_string())
    }

    async fn create_vm(&self, _template_name: &str, name: &str) -> hypervisor_rpc::Result<String> {
        self.vms.lock().await.insert(name.to_string());
        Ok("created".to_string())
    }

    async fn delete_vm(&self, name: &str) -> hypervisor_rpc::Result<String> {
        self.vms.lock().await.remove(name);
        self.running.lock().await.remove(name);
        Ok("deleted".to_string())
    }

    async fn get_vm_network_info(&self, _name: &str) -> hypervisor_rpc::Result<NetworkInfo> {
        let idx = self.network_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.network_script.lock().await;
        Ok(script[idx.min(script.len() - 1)].clone())
    }

    async fn run_command_on_vm(&self, _name: &str, _argv: &[String]) -> hypervisor_rpc::Result<String> {
        Ok(String::new())
    }

    async fn is_vm_running(&self, name: &str) -> hypervisor_rpc::Result<bool> {
        Ok(self.running.lock().await.contains(name))
    }

    async fn is_agent_running(&self, _name: &str) -> hypervisor_rpc::Result<bool> {
        Ok(true)
    }

    async fn get_resource_usage(&self) -> hypervisor_rpc::Result<Value> {
        Ok(Value::Null)
    }

    async fn get_vm_config(&self, _name: &str) -> hypervisor_rpc::Result<Value> {
        Ok(Value::Null)
    }

    async fn get_template_config(&self, _template_name: &str) -> hypervisor_rpc::Result<Value> {
        Ok(Value::Null)
    }

    async fn vm_exists(&self, name: &str) -> hypervisor_rpc::Result<bool> {
        Ok(self.vms.lock().await.contains(name))
    }

    async fn get_all_vm_names(&self) -> hypervisor_rpc::Result<Vec<String>> {
        Ok(self.vms.lock().await.iter().cloned().collect())
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    engines: Arc<EngineHandler>,
    handler: ReservationHandler,
    engine_id: Uuid,
    template_id: Uuid,
}

async fn seeded(network_script: Vec<NetworkInfo>) -> (Fixture, Arc<FakeEngineClient>) {
    let store = Arc::new(MemoryStore::new());
    let engine_type = store.create_engine_type("proxmox").await;

    let mut max = ResourceMap::new();
    max.insert("cpu".to_string(), 8);
    max.insert("ram".to_string(), 16);
    let engine = Engine {
        id: Uuid::new_v4(),
        name: "e1".to_string(),
        port: 5000,
        engine_type: engine_type.id,
        available_resources: max.clone(),
        max_resources: max,
    };
    let engine_id = store.create_engine(engine).await;

    let host = Host {
        id: Uuid::new_v4(),
        name: "h1".to_string(),
        ip_address: "127.0.0.1".to_string(),
        engines: [engine_id].into_iter().collect(),
    };
    store.create_host(host).await;

    let mut req = ResourceMap::new();
    req.insert("cpu".to_string(), 4);
    req.insert("ram".to_string(), 8);
    let template = Template {
        id: Uuid::new_v4(),
        name: "Windows 10".to_string(),
        internal_name: "win10-template".to_string(),
        description: String::new(),
        allowed_engine_types: [engine_type.id].into_iter().collect(),
        tags: HashSet::new(),
        resource_requirements: req,
    };
    let template_id = store.create_template(template).await;

    let store_dyn: Arc<dyn Store> = store.clone();
    let engines = EngineHandler::new(store_dyn.clone());
    let fake = Arc::new(FakeEngineClient::new(network_script));
    engines.register_client(engine_id, fake.clone() as Arc<dyn EngineClient>).await;
    let handler = ReservationHandler::new(store_dyn, engines.clone());

    (
        Fixture {
            store,
            engines,
            handler,
            engine_id,
            template_id,
        },
        fake,
    )
}

async fn wait_for<F, Fut>(mut pred: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if pred().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

async fn wait_for_workstation_status(store: &Arc<MemoryStore>, ws_id: Uuid, status: WorkstationStatus) {
    wait_for(|| async { store.get_workstation(ws_id).await.map(|w| w.status) == Some(status) }).await;
}

async fn wait_for_reservation_status(store: &Arc<MemoryStore>, id: Uuid, status: ReservationStatus) {
    wait_for(|| async { store.get_reservation(id).await.map(|r| r.status) == Some(status) }).await;
}

#[tokio::test]
async fn happy_path_pending_to_completed() {
    let (fx, _fake) = seeded(vec![NetworkInfo {
        ip_address: "10.0.0.5".to_string(),
        subnet_mask: "255.255.255.0".to_string(),
    }])
    .await;

    let now = Utc::now();
    let reservation = coordinator::model::Reservation {
        id: Uuid::new_v4(),
        status: ReservationStatus::Pending,
        request_date: now,
        start_date: now - chrono::Duration::seconds(1),
        end_date: now + chrono::Duration::milliseconds(200),
        user: "alice".to_string(),
        template: fx.template_id,
        workstation: None,
        proxy_mapping: None,
        user_label: String::new(),
        last_status_update: now,
        additional_information: None,
    };
    let id = fx.store.create_reservation(reservation).await;

    // Tick 1: Pending -> Approved, Workstation Scheduled.
    fx.handler.handle().await;
    let r = fx.store.get_reservation(id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);

    // Tick 2: start date already elapsed -> begins setup. The setup
    // worker's callback drives workstation Active and reservation Active
    // without a further tick.
    fx.handler.handle().await;
    let ws_id = fx.store.get_reservation(id).await.unwrap().workstation.unwrap();
    wait_for_workstation_status(&fx.store, ws_id, WorkstationStatus::Active).await;
    wait_for_reservation_status(&fx.store, id, ReservationStatus::Active).await;

    // Wait out the window, then the next tick tears it down.
    tokio::time::sleep(Duration::from_millis(250)).await;
    fx.handler.handle().await;
    wait_for_workstation_status(&fx.store, ws_id, WorkstationStatus::Archived).await;
    wait_for_reservation_status(&fx.store, id, ReservationStatus::Completed).await;
}

#[tokio::test]
async fn apipa_hold_off_waits_for_real_address() {
    let (fx, _fake) = seeded(vec![
        NetworkInfo {
            ip_address: "169.254.1.2".to_string(),
            subnet_mask: "255.255.0.0".to_string(),
        },
        NetworkInfo {
            ip_address: "169.254.1.2".to_string(),
            subnet_mask: "255.255.0.0".to_string(),
        },
        NetworkInfo {
            ip_address: "10.0.0.5".to_string(),
            subnet_mask: "255.255.255.0".to_string(),
        },
    ])
    .await;

    let vm_name = "TestVm".to_string();
    let ws = Workstation::scheduled(fx.template_id, Uuid::new_v4(), fx.engine_id);
    let ws_id = fx.store.create_workstation(ws).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    let on_done: coordinator::engine_handler::Callback = Box::new(move |success| {
        let tx = tx.take().unwrap();
        Box::pin(async move {
            let _ = tx.send(success);
        })
    });

    fx.engines
        .start_setup_worker(
            Uuid::new_v4(),
            ws_id,
            fx.engine_id,
            "win10-template".to_string(),
            vm_name,
            on_done,
        )
        .await
        .unwrap();

    // Two APIPA responses are polled out at `IP_POLL_INTERVAL` (5s) before
    // the real address is observed - give this comfortable real-time room.
    let success = tokio::time::timeout(Duration::from_secs(15), rx).await.unwrap().unwrap();
    assert!(success);

    let ws_after = fx.store.get_workstation(ws_id).await.unwrap();
    assert_eq!(ws_after.ip.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
async fn orphan_sweep_deletes_unreferenced_vm_but_spares_active_one() {
    let (fx, fake) = seeded(vec![NetworkInfo {
        ip_address: "10.0.0.5".to_string(),
        subnet_mask: "255.255.255.0".to_string(),
    }])
    .await;

    // An orphan: present on the engine, no Workstation row references it.
    fake.create_vm("win10-template", "OrphanVm").await.unwrap();

    // A legitimately active VM: referenced by an Active reservation whose
    // Workstation is Setup.
    fake.create_vm("win10-template", "KeepVm").await.unwrap();
    let mut ws = Workstation::scheduled(fx.template_id, Uuid::new_v4(), fx.engine_id);
    ws.status = WorkstationStatus::Setup;
    ws.engine_internal_name = Some("KeepVm".to_string());
    let ws_id = fx.store.create_workstation(ws).await;

    let now = Utc::now();
    let reservation = coordinator::model::Reservation {
        id: Uuid::new_v4(),
        status: ReservationStatus::Active,
        request_date: now,
        start_date: now,
        end_date: now + chrono::Duration::hours(1),
        user: "alice".to_string(),
        template: fx.template_id,
        workstation: Some(ws_id),
        proxy_mapping: None,
        user_label: String::new(),
        last_status_update: now,
        additional_information: None,
    };
    fx.store.create_reservation(reservation).await;

    fx.engines.clean_orphaned_workstations().await;

    let names = fake.get_all_vm_names().await.unwrap();
    assert!(!names.contains(&"OrphanVm".to_string()));
    assert!(names.contains(&"KeepVm".to_string()));
}
