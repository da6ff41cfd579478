//! Entity types for the coordinator's data model (spec §3).
//!
//! Every entity carries a v4 UUID primary key, matching
//! `models.UUIDField(default=uuid.uuid4)` in the reference schema.
//! `additional_information` fields are opaque `serde_json::Value`s the
//! core round-trips but never interprets.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ResourceMap = HashMap<String, i64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineType {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub id: Uuid,
    pub name: String,
    pub port: u16,
    pub engine_type: Uuid,
    pub available_resources: ResourceMap,
    pub max_resources: ResourceMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    pub ip_address: String,
    pub engines: HashSet<Uuid>,
}

impl Host {
    /// The endpoint an engine on this host is reachable at, per spec §3.
    pub fn engine_endpoint(&self, engine: &Engine) -> String {
        format!("http://{}:{}/api/v1", self.ip_address, engine.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub internal_name: String,
    pub description: String,
    pub allowed_engine_types: HashSet<Uuid>,
    pub tags: HashSet<Uuid>,
    pub resource_requirements: ResourceMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkstationStatus {
    Scheduled,
    Setup,
    Active,
    Restart,
    Cleanup,
    Archived,
    Broken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workstation {
    pub id: Uuid,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub template: Uuid,
    pub host: Option<Uuid>,
    pub engine: Option<Uuid>,
    pub status: WorkstationStatus,
    pub engine_internal_name: Option<String>,
    pub last_status_update: DateTime<Utc>,
    pub additional_information: Option<serde_json::Value>,
}

impl Workstation {
    pub fn scheduled(template: Uuid, host: Uuid, engine: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            ip: None,
            port: None,
            template,
            host: Some(host),
            engine: Some(engine),
            status: WorkstationStatus::Scheduled,
            engine_internal_name: None,
            last_status_update: Utc::now(),
            additional_information: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMapping {
    pub id: Uuid,
    pub workstation: Uuid,
    pub external_path: String,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub looked_up: bool,
}

impl ProxyMapping {
    pub fn new(workstation: Uuid) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            workstation,
            external_path: format!("/novnc/{id}"),
            created_at: Utc::now(),
            archived_at: None,
            archived: false,
            looked_up: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Active,
    Completed,
    Rejected,
    Cancelled,
    Broken,
}

impl ReservationStatus {
    /// `true` once the reservation cannot transition further (spec §3).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Rejected | ReservationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub status: ReservationStatus,
    pub request_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub user: String,
    pub template: Uuid,
    pub workstation: Option<Uuid>,
    pub proxy_mapping: Option<Uuid>,
    pub user_label: String,
    pub last_status_update: DateTime<Utc>,
    pub additional_information: Option<serde_json::Value>,
}

impl Reservation {
    /// Whether `[start, end]` overlaps `other`'s window (spec §4.4), as
    /// the union of the original's four interval-overlap cases rather
    /// than a single inequality — kept in that shape so it reads the way
    /// the query it replaces did.
    pub fn overlaps(&self, other: &Reservation) -> bool {
        let starts_during = other.start_date >= self.start_date && other.start_date <= self.end_date;
        let ends_during = other.end_date >= self.start_date && other.end_date <= self.end_date;
        let surrounds = other.start_date <= self.start_date && other.end_date >= self.end_date;
        let inside = other.start_date >= self.start_date && other.end_date <= self.end_date;
        starts_during || ends_during || surrounds || inside
    }
}
