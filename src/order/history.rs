//! Finalization and the historical order archive.
//!
//! Finalizing a session captures and clears the active document in one
//! atomic read-modify-write, then writes the immutable `HistoricalOrder`
//! snapshot and prepends its id to the newest-first history index. The
//! capture-and-clear is transactional so participant orders arriving
//! concurrently are either in the snapshot or land on a fresh (empty)
//! session — never silently discarded.

use crate::errors::SessionError;
use crate::order::grand_total;
use crate::session::document::{Participant, ParticipantOrder, SessionDocument};
use crate::session::session_key;
use crate::sync::SyncClient;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Store key of the newest-first index of historical order ids.
pub const HISTORY_INDEX_KEY: &str = "history_index";

/// Store key of the historical order `order_id`.
pub fn history_key(order_id: &str) -> String {
    format!("history/{order_id}")
}

/// Immutable record of a completed session. Written once at finalization,
/// never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_date: Option<NaiveDate>,
    pub completed_at: DateTime<Utc>,
    pub total_amount: u64,
    #[serde(default)]
    pub admin_name: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub per_participant_orders: BTreeMap<String, ParticipantOrder>,
    #[serde(default)]
    pub selected_restaurant_id: Option<u32>,
    #[serde(default)]
    pub selected_drink_shop_id: Option<u32>,
}

impl HistoricalOrder {
    fn from_session(order_id: &str, doc: &SessionDocument) -> Self {
        Self {
            order_id: order_id.to_string(),
            order_date: doc.order_date,
            completed_at: Utc::now(),
            total_amount: grand_total(doc),
            admin_name: doc.admin_name.clone(),
            participants: doc.participants.clone(),
            per_participant_orders: doc.per_participant_orders.clone(),
            selected_restaurant_id: doc.selected_restaurant_id,
            selected_drink_shop_id: doc.selected_drink_shop_id,
        }
    }
}

/// The newest-first list of historical order ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryIndex {
    #[serde(default)]
    pub order_ids: Vec<String>,
}

/// Finalize the session: atomically capture and clear the active document,
/// archive the snapshot, prepend its id to the index.
///
/// Returns `None` when there was no active document to finalize. The
/// cleared document is simply absent — an absent session document is the
/// valid empty state.
pub async fn finalize(
    sync: &SyncClient,
    session_id: &str,
) -> Result<Option<HistoricalOrder>, SessionError> {
    let pre_image = sync.update(&session_key(session_id), |_| None).await?;
    let Some(raw) = pre_image else {
        return Ok(None);
    };
    let doc = SessionDocument::from_value(raw)
        .map_err(|err| SessionError::Sync(crate::errors::StoreError::from(err).into()))?;

    let snapshot = HistoricalOrder::from_session(session_id, &doc);
    let value = serde_json::to_value(&snapshot)
        .map_err(|err| SessionError::Sync(crate::errors::StoreError::from(err).into()))?;
    sync.put(&history_key(session_id), value).await.map_err(SessionError::Sync)?;

    let order_id = snapshot.order_id.clone();
    sync.update(HISTORY_INDEX_KEY, move |index| {
        let mut index: HistoryIndex = index
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        index.order_ids.retain(|id| id != &order_id);
        index.order_ids.insert(0, order_id.clone());
        serde_json::to_value(index).ok()
    })
    .await?;

    info!(
        order_id = %snapshot.order_id,
        total = snapshot.total_amount,
        "session finalized"
    );
    Ok(Some(snapshot))
}

/// Historical order ids, newest first.
pub async fn history_ids(sync: &SyncClient) -> Result<Vec<String>, SessionError> {
    let result = sync.read(HISTORY_INDEX_KEY).await?;
    let index: HistoryIndex = result
        .into_document()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    Ok(index.order_ids)
}

/// Load one archived order, `None` if it does not exist.
pub async fn load_history(
    sync: &SyncClient,
    order_id: &str,
) -> Result<Option<HistoricalOrder>, SessionError> {
    let result = sync.read(&history_key(order_id)).await?;
    match result.into_document() {
        Some(value) => {
            let order = serde_json::from_value(value)
                .map_err(|err| SessionError::Sync(crate::errors::StoreError::from(err).into()))?;
            Ok(Some(order))
        }
        None => Ok(None),
    }
}
