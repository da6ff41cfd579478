//! The call surface an (out-of-scope) HTTP front end consumes (spec §6),
//! ported from `main_server/api_views.py` and `main_server/views.py` with
//! the Django request/response plumbing stripped away: every view there
//! became a plain async function here that an HTTP handler can call
//! directly and serialize however it likes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::model::{ProxyMapping, Reservation, Tag};
use crate::template_handler;

pub async fn get_all_tags(coordinator: &Coordinator) -> Vec<Tag> {
    coordinator.store().list_tags().await
}

pub async fn get_all_tags_containing_text(coordinator: &Coordinator, text: &str) -> Vec<Tag> {
    template_handler::get_tags_containing_string_anycase(coordinator.store(), text).await
}

/// Resolves the requested tag *names* to rows first, then computes the
/// compatible set — mirroring `get_tags_compatible_with_tags`'s two-step
/// shape in the original view (`get_tags_by_string` then
/// `get_tags_compatible_with_tags`). Unresolved names are dropped rather
/// than failing the whole call, since the original tolerates holes here.
pub async fn get_tags_compatible_with_tags(coordinator: &Coordinator, tag_names: &[String]) -> Vec<Tag> {
    let resolved = template_handler::get_tags_by_string(coordinator.store(), tag_names).await;
    let ids: Vec<Uuid> = resolved.into_iter().flatten().map(|t| t.id).collect();
    template_handler::get_tags_compatible_with_tags(coordinator.store(), &ids).await
}

pub async fn get_mapping_target_for_reservation_by_token(coordinator: &Coordinator, token: Uuid) -> String {
    coordinator.reservations.get_mapping_target_by_id(token).await
}

pub async fn create_reservation(
    coordinator: &Coordinator,
    user: String,
    tag_names: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    label: Option<String>,
) -> Result<Reservation> {
    let resolved = template_handler::get_tags_by_string(coordinator.store(), tag_names).await;
    let tags: Vec<Uuid> = resolved.into_iter().flatten().map(|t| t.id).collect();
    coordinator
        .reservations
        .create_reservation(user, &tags, start, end, label)
        .await
}

pub async fn cancel_reservation(coordinator: &Coordinator, reservation_id: Uuid) -> Result<()> {
    coordinator.reservations.cancel_reservation(reservation_id).await
}

pub async fn restart_workstation_for_reservation(coordinator: &Coordinator, reservation_id: Uuid) -> Result<()> {
    coordinator
        .reservations
        .restart_workstation_for_reservation(reservation_id)
        .await
}

pub async fn access_reservation(coordinator: &Coordinator, reservation_id: Uuid) -> Result<ProxyMapping> {
    coordinator.reservations.access_reservation(reservation_id).await
}
