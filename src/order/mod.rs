//! Order aggregation.
//!
//! Item lists are plain vectors of immutable instances: adding pushes a new
//! instance with a fresh id, removing deletes exactly one instance found by
//! scanning backward (so the most recently added unit of a repeated item
//! goes first — the quick "undo last add" case). Totals are exact integer
//! sums partitioned by store kind; customization surcharges were folded
//! into `unit_price` at add time, so aggregation never recomputes them.

pub mod history;

pub use history::{finalize, history_ids, history_key, load_history, HistoricalOrder, HistoryIndex};

use crate::session::document::{OrderItem, SessionDocument, StoreKind};
use uuid::Uuid;

/// Remove the single instance with `instance_id`, scanning from the end.
///
/// Returns the removed item, or `None` when no instance matches. Never
/// removes more than one instance.
pub fn remove_instance(items: &mut Vec<OrderItem>, instance_id: Uuid) -> Option<OrderItem> {
    let index = items
        .iter()
        .rposition(|item| item.instance_id == instance_id)?;
    Some(items.remove(index))
}

/// Sum of `unit_price` over items of one store kind.
pub fn subtotal(items: &[OrderItem], kind: StoreKind) -> u64 {
    items
        .iter()
        .filter(|item| item.store_kind == kind)
        .map(|item| u64::from(item.unit_price))
        .sum()
}

/// Sum of `unit_price` over all items in a list.
pub fn participant_total(items: &[OrderItem]) -> u64 {
    items.iter().map(|item| u64::from(item.unit_price)).sum()
}

/// Grand total over every participant's items in the document.
pub fn grand_total(doc: &SessionDocument) -> u64 {
    doc.per_participant_orders
        .values()
        .map(|order| participant_total(&order.items))
        .sum()
}
