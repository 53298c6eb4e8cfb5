//! The replicated session document.
//!
//! The remote store hands back loosely-shaped JSON; everything here is
//! explicit — optional fields are `Option`, never key-absent-means-null —
//! and `from_value` normalizes on every read. Writers never send whole
//! documents: each field group has a patch builder producing exactly the
//! fields that writer owns, so merge-writes cannot clobber siblings.

use crate::store::Document;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current document shape version, stamped on creation.
pub const DOC_VERSION: u32 = 1;

/// Session-level stage, shared by all participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Setup,
    SourceSelected,
    Ordering,
    ClosingOut,
}

/// Which menu source an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Restaurant,
    Drink,
}

/// A session member. Ordered set semantics: the document keeps insertion
/// order and ids are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// One physically added unit of a menu item. Immutable once added; removal
/// is by `instance_id`, never by decrementing a quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub catalog_id: u32,
    pub name: String,
    /// Price in the smallest currency unit; customization surcharges are
    /// already folded in at add time.
    pub unit_price: u32,
    pub instance_id: Uuid,
    pub store_kind: StoreKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customizations: Option<String>,
}

impl OrderItem {
    /// Create a new instance with a fresh, never-reused `instance_id`.
    pub fn new(
        catalog_id: u32,
        name: impl Into<String>,
        unit_price: u32,
        store_kind: StoreKind,
        customizations: Option<String>,
    ) -> Self {
        Self {
            catalog_id,
            name: name.into(),
            unit_price,
            instance_id: Uuid::new_v4(),
            store_kind,
            customizations,
        }
    }
}

/// One participant's contribution. A present key does not imply non-empty
/// items.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParticipantOrder {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// The single shared document per ordering session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub doc_version: u32,
    #[serde(default)]
    pub phase: SessionPhase,
    #[serde(default)]
    pub admin_id: String,
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
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_reached: bool,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order_date: Option<NaiveDate>,
}

impl SessionDocument {
    /// A fresh document in `Setup`, created by the admin.
    pub fn new(
        admin_id: impl Into<String>,
        admin_name: impl Into<String>,
        participants: Vec<Participant>,
        order_date: NaiveDate,
    ) -> Self {
        let admin_id = admin_id.into();
        let admin_name = admin_name.into();
        let mut doc = Self {
            doc_version: DOC_VERSION,
            phase: SessionPhase::Setup,
            admin_id: admin_id.clone(),
            admin_name: admin_name.clone(),
            participants,
            per_participant_orders: BTreeMap::new(),
            selected_restaurant_id: None,
            selected_drink_shop_id: None,
            deadline: None,
            deadline_reached: false,
            is_closed: false,
            created_at: Some(Utc::now()),
            order_date: Some(order_date),
        };
        if !doc.participants.iter().any(|p| p.id == admin_id) {
            doc.participants.insert(
                0,
                Participant {
                    id: admin_id,
                    name: admin_name,
                },
            );
        }
        doc.normalize();
        doc
    }

    /// Parse a raw store document, normalizing its shape.
    pub fn from_value(value: Document) -> Result<Self, serde_json::Error> {
        let mut doc: SessionDocument = serde_json::from_value(value)?;
        doc.normalize();
        Ok(doc)
    }

    /// Serialize for the store.
    pub fn to_value(&self) -> Result<Document, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Repair shape drift from the loosely-typed store: deduplicate
    /// participant ids (first occurrence wins), trim names, and fill
    /// missing order display names from the roster.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::BTreeSet::new();
        self.participants.retain(|p| seen.insert(p.id.clone()));
        for p in &mut self.participants {
            p.name = p.name.trim().to_string();
        }
        self.admin_name = self.admin_name.trim().to_string();
        for (id, order) in &mut self.per_participant_orders {
            if order.display_name.trim().is_empty() {
                order.display_name = self
                    .participants
                    .iter()
                    .find(|p| &p.id == id)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| id.clone());
            }
        }
    }

    /// Whether at least one ordering source has been chosen.
    pub fn has_source(&self) -> bool {
        self.selected_restaurant_id.is_some() || self.selected_drink_shop_id.is_some()
    }

    /// Whether `participant_id` has already contributed a drink item.
    pub fn has_ordered_drinks(&self, participant_id: &str) -> bool {
        self.per_participant_orders
            .get(participant_id)
            .map(|order| {
                order
                    .items
                    .iter()
                    .any(|item| item.store_kind == StoreKind::Drink)
            })
            .unwrap_or(false)
    }

    /// Items contributed by `participant_id`, empty if none yet.
    pub fn items_of(&self, participant_id: &str) -> &[OrderItem] {
        self.per_participant_orders
            .get(participant_id)
            .map(|order| order.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn participant_named(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }
}

// ── Patch builders ───────────────────────────────────────────────────
//
// Each writer owns a field group; patches carry only that group. The
// participants and items lists are rewritten whole: the store has no
// array-append primitive, and a full-list rewrite stays idempotent under
// retry.

/// Admin: session phase.
pub fn patch_phase(phase: SessionPhase) -> Document {
    json!({ "phase": phase })
}

/// Admin: source selections plus the accompanying phase step.
pub fn patch_sources(restaurant_id: Option<u32>, drink_shop_id: Option<u32>) -> Document {
    json!({
        "selected_restaurant_id": restaurant_id,
        "selected_drink_shop_id": drink_shop_id,
        "phase": SessionPhase::SourceSelected,
    })
}

/// Admin: a new deadline. Explicitly re-opens `deadline_reached`; nothing
/// else ever resets that flag.
pub fn patch_deadline(deadline: DateTime<Utc>) -> Document {
    json!({
        "deadline": deadline,
        "deadline_reached": false,
    })
}

/// Deadline watcher: the single crossing write.
pub fn patch_deadline_reached() -> Document {
    json!({ "deadline_reached": true })
}

/// Admin: early close. `is_closed` is never unset within a session.
pub fn patch_closed() -> Document {
    json!({
        "is_closed": true,
        "phase": SessionPhase::ClosingOut,
    })
}

/// A participant: their own full order entry.
pub fn patch_participant_order(participant_id: &str, order: &ParticipantOrder) -> Document {
    json!({
        "per_participant_orders": { participant_id: order }
    })
}

/// Admin: the full participants roster (ad hoc additions rewrite the list).
pub fn patch_participants(participants: &[Participant]) -> Document {
    json!({ "participants": participants })
}
