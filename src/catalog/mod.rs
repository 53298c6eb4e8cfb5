//! Contracts for the external collaborators the engine consumes.
//!
//! The menu catalog (parsed elsewhere from a static document) and the team
//! roster are pure data, loaded once per session setup. Roster failures
//! fall back to a fixed built-in roster so session creation never blocks
//! on the roster service.

use crate::session::document::Participant;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A priced menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: u32,
    pub name: String,
    /// Price in the smallest currency unit.
    pub price: u32,
}

/// An ordered group of menu items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuCategory {
    pub id: u32,
    pub name: String,
    pub items: Vec<MenuItem>,
}

/// An addable topping with its surcharge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topping {
    pub id: u32,
    pub name: String,
    pub surcharge: u32,
}

/// A full menu for one source (restaurant or drink shop).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    #[serde(default)]
    pub categories: Vec<MenuCategory>,
    #[serde(default)]
    pub toppings: Vec<Topping>,
}

/// Fold topping surcharges into a base price, producing the `unit_price`
/// an order item carries. Aggregation never recomputes surcharges.
pub fn price_with_toppings(base: u32, toppings: &[Topping]) -> u32 {
    toppings
        .iter()
        .fold(base, |price, topping| price.saturating_add(topping.surcharge))
}

/// Supplies the menu for a source id. Read-only, called once per setup.
#[async_trait]
pub trait CatalogLoader: Send + Sync {
    async fn load_menu(&self, source_id: u32) -> anyhow::Result<Menu>;
}

/// Supplies the team roster used to pre-populate session participants.
#[async_trait]
pub trait RosterLoader: Send + Sync {
    async fn load_roster(&self) -> anyhow::Result<Vec<Participant>>;
}

/// The fixed roster used when the roster service is unreachable.
pub fn builtin_roster() -> Vec<Participant> {
    ["Ann", "Ben", "Chi", "Dee"]
        .iter()
        .enumerate()
        .map(|(index, name)| Participant {
            id: format!("builtin-{index}"),
            name: (*name).to_string(),
        })
        .collect()
}

/// Load the roster, falling back to [`builtin_roster`] on failure.
pub async fn load_roster_or_default(loader: &dyn RosterLoader) -> Vec<Participant> {
    match loader.load_roster().await {
        Ok(roster) if !roster.is_empty() => roster,
        Ok(_) => {
            warn!("roster service returned an empty roster, using builtin");
            builtin_roster()
        }
        Err(err) => {
            warn!(error = %err, "roster service failed, using builtin");
            builtin_roster()
        }
    }
}
