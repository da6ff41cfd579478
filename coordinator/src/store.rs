//! In-memory stand-in for the out-of-scope persistent store.
//!
//! [`Store`] captures exactly the read/write/query operations the
//! handlers need — the Rust equivalent of the Django QuerySet calls in
//! `reservation_handler.py` / `engine_handler.py` — so a real database
//! layer could implement the same trait without touching the handlers.
//! [`MemoryStore`] is the only implementation here, backed by a single
//! `tokio::sync::RwLock` (many concurrent readers across handler passes,
//! one writer per transition, per spec §5).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::model::*;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_tags(&self) -> Vec<Tag>;
    async fn find_tags_by_names(&self, names: &[String]) -> Vec<Option<Tag>>;
    async fn tags_containing(&self, substr: &str) -> Vec<Tag>;
    async fn create_tag(&self, name: &str) -> Tag;

    async fn list_templates(&self) -> Vec<Template>;
    async fn get_template(&self, id: Uuid) -> Option<Template>;
    async fn create_template(&self, template: Template) -> Uuid;

    async fn list_engine_types(&self) -> Vec<EngineType>;
    async fn create_engine_type(&self, name: &str) -> EngineType;

    async fn list_engines(&self) -> Vec<Engine>;
    async fn get_engine(&self, id: Uuid) -> Option<Engine>;
    async fn create_engine(&self, engine: Engine) -> Uuid;

    async fn host_for_engine(&self, engine_id: Uuid) -> Option<Host>;
    async fn create_host(&self, host: Host) -> Uuid;

    async fn list_workstations(&self) -> Vec<Workstation>;
    async fn get_workstation(&self, id: Uuid) -> Option<Workstation>;
    async fn create_workstation(&self, ws: Workstation) -> Uuid;
    async fn set_workstation_status(&self, id: Uuid, status: WorkstationStatus) -> Option<Workstation>;
    async fn set_workstation_network(
        &self,
        id: Uuid,
        ip: String,
        port: u16,
        engine_internal_name: String,
    ) -> Option<Workstation>;

    async fn list_reservations(&self) -> Vec<Reservation>;
    async fn get_reservation(&self, id: Uuid) -> Option<Reservation>;
    async fn create_reservation(&self, r: Reservation) -> Uuid;
    async fn set_reservation_status(&self, id: Uuid, status: ReservationStatus) -> Option<Reservation>;
    async fn attach_workstation(&self, reservation_id: Uuid, workstation_id: Uuid) -> Option<Reservation>;
    async fn attach_mapping(&self, reservation_id: Uuid, mapping_id: Option<Uuid>) -> Option<Reservation>;

    async fn get_mapping(&self, id: Uuid) -> Option<ProxyMapping>;
    async fn create_mapping(&self, m: ProxyMapping) -> Uuid;
    async fn archive_mapping(&self, id: Uuid) -> Option<ProxyMapping>;

    /// Atomically flips `looked_up` if this is the first lookup, under a
    /// single lock acquisition so two concurrent first-lookups can't both
    /// observe `looked_up == false` (spec §4.4 one-shot resolution).
    /// Returns the mapping's state *after* the call, and whether this
    /// call was the one that performed the first-lookup transition.
    async fn look_up_mapping(&self, id: Uuid) -> Option<(ProxyMapping, bool)>;
}

#[derive(Default)]
struct Inner {
    tags: Vec<Tag>,
    engine_types: Vec<EngineType>,
    engines: Vec<Engine>,
    hosts: Vec<Host>,
    templates: Vec<Template>,
    workstations: HashMap<Uuid, Workstation>,
    reservations: HashMap<Uuid, Reservation>,
    mappings: HashMap<Uuid, ProxyMapping>,
}

pub struct MemoryStore {
    inner: tokio::sync::RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_tags(&self) -> Vec<Tag> {
        self.inner.read().await.tags.clone()
    }

    async fn find_tags_by_names(&self, names: &[String]) -> Vec<Option<Tag>> {
        let inner = self.inner.read().await;
        names
            .iter()
            .map(|name| inner.tags.iter().find(|t| &t.name == name).cloned())
            .collect()
    }

    async fn tags_containing(&self, substr: &str) -> Vec<Tag> {
        let needle = substr.to_lowercase();
        self.inner
            .read()
            .await
            .tags
            .iter()
            .filter(|t| t.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    async fn create_tag(&self, name: &str) -> Tag {
        let tag = Tag {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.inner.write().await.tags.push(tag.clone());
        tag
    }

    async fn list_templates(&self) -> Vec<Template> {
        self.inner.read().await.templates.clone()
    }

    async fn get_template(&self, id: Uuid) -> Option<Template> {
        self.inner
            .read()
            .await
            .templates
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    async fn create_template(&self, template: Template) -> Uuid {
        let id = template.id;
        self.inner.write().await.templates.push(template);
        id
    }

    async fn list_engine_types(&self) -> Vec<EngineType> {
        self.inner.read().await.engine_types.clone()
    }

    async fn create_engine_type(&self, name: &str) -> EngineType {
        let et = EngineType {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.inner.write().await.engine_types.push(et.clone());
        et
    }

    async fn list_engines(&self) -> Vec<Engine> {
        self.inner.read().await.engines.clone()
    }

    async fn get_engine(&self, id: Uuid) -> Option<Engine> {
        self.inner
            .read()
            .await
            .engines
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    async fn create_engine(&self, engine: Engine) -> Uuid {
        let id = engine.id;
        self.inner.write().await.engines.push(engine);
        id
    }

    async fn host_for_engine(&self, engine_id: Uuid) -> Option<Host> {
        self.inner
            .read()
            .await
            .hosts
            .iter()
            .find(|h| h.engines.contains(&engine_id))
            .cloned()
    }

    async fn create_host(&self, host: Host) -> Uuid {
        let id = host.id;
        self.inner.write().await.hosts.push(host);
        id
    }

    async fn list_workstations(&self) -> Vec<Workstation> {
        self.inner.read().await.workstations.values().cloned().collect()
    }

    async fn get_workstation(&self, id: Uuid) -> Option<Workstation> {
        self.inner.read().await.workstations.get(&id).cloned()
    }

    async fn create_workstation(&self, ws: Workstation) -> Uuid {
        let id = ws.id;
        self.inner.write().await.workstations.insert(id, ws);
        id
    }

    async fn set_workstation_status(&self, id: Uuid, status: WorkstationStatus) -> Option<Workstation> {
        let mut inner = self.inner.write().await;
        let ws = inner.workstations.get_mut(&id)?;
        ws.status = status;
        ws.last_status_update = Utc::now();
        Some(ws.clone())
    }

    async fn set_workstation_network(
        &self,
        id: Uuid,
        ip: String,
        port: u16,
        engine_internal_name: String,
    ) -> Option<Workstation> {
        let mut inner = self.inner.write().await;
        let ws = inner.workstations.get_mut(&id)?;
        ws.ip = Some(ip);
        ws.port = Some(port);
        ws.engine_internal_name = Some(engine_internal_name);
        Some(ws.clone())
    }

    async fn list_reservations(&self) -> Vec<Reservation> {
        self.inner.read().await.reservations.values().cloned().collect()
    }

    async fn get_reservation(&self, id: Uuid) -> Option<Reservation> {
        self.inner.read().await.reservations.get(&id).cloned()
    }

    async fn create_reservation(&self, r: Reservation) -> Uuid {
        let id = r.id;
        self.inner.write().await.reservations.insert(id, r);
        id
    }

    async fn set_reservation_status(&self, id: Uuid, status: ReservationStatus) -> Option<Reservation> {
        let mut inner = self.inner.write().await;
        let r = inner.reservations.get_mut(&id)?;
        r.status = status;
        r.last_status_update = Utc::now();
        Some(r.clone())
    }

    async fn attach_workstation(&self, reservation_id: Uuid, workstation_id: Uuid) -> Option<Reservation> {
        let mut inner = self.inner.write().await;
        let r = inner.reservations.get_mut(&reservation_id)?;
        r.workstation = Some(workstation_id);
        Some(r.clone())
    }

    async fn attach_mapping(&self, reservation_id: Uuid, mapping_id: Option<Uuid>) -> Option<Reservation> {
        let mut inner = self.inner.write().await;
        let r = inner.reservations.get_mut(&reservation_id)?;
        r.proxy_mapping = mapping_id;
        Some(r.clone())
    }

    async fn get_mapping(&self, id: Uuid) -> Option<ProxyMapping> {
        self.inner.read().await.mappings.get(&id).cloned()
    }

    async fn create_mapping(&self, m: ProxyMapping) -> Uuid {
        let id = m.id;
        self.inner.write().await.mappings.insert(id, m);
        id
    }

    async fn archive_mapping(&self, id: Uuid) -> Option<ProxyMapping> {
        let mut inner = self.inner.write().await;
        let m = inner.mappings.get_mut(&id)?;
        m.archived = true;
        m.archived_at = Some(Utc::now());
        Some(m.clone())
    }

    async fn look_up_mapping(&self, id: Uuid) -> Option<(ProxyMapping, bool)> {
        let mut inner = self.inner.write().await;
        let m = inner.mappings.get_mut(&id)?;
        if m.looked_up {
            return Some((m.clone(), false));
        }
        m.looked_up = true;
        Some((m.clone(), true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn look_up_mapping_is_one_shot() {
        let store = MemoryStore::new();
        let mapping = ProxyMapping::new(Uuid::new_v4());
        let id = store.create_mapping(mapping).await;

        let (_, first) = store.look_up_mapping(id).await.unwrap();
        let (_, second) = store.look_up_mapping(id).await.unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn set_workstation_status_stamps_last_status_update() {
        let store = MemoryStore::new();
        let ws = Workstation::scheduled(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let id = store.create_workstation(ws).await;

        let before = store.get_workstation(id).await.unwrap().last_status_update;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store
            .set_workstation_status(id, WorkstationStatus::Setup)
            .await
            .unwrap();

        assert_eq!(updated.status, WorkstationStatus::Setup);
        assert!(updated.last_status_update >= before);
    }
}
