//! Phase state machine.
//!
//! Session phases are shared and admin-driven; each participant's local
//! phase is *derived* from shared state, never chosen independently. The
//! derivation is a pure function so re-running it on identical inputs is
//! always identical output, and callers only act when the derived value
//! changes — no transition storms on redundant remote echoes.

use crate::errors::SessionError;
use crate::session::document::{SessionDocument, SessionPhase};
use serde::{Deserialize, Serialize};

/// Participant role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
}

/// A participant's local, client-side phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalPhase {
    WaitingForSetup,
    SelectingSource,
    OrderingRestaurant,
    OrderingDrinks,
    PersonalReview,
    AdminReview,
}

/// Derive the local phase a client should be in.
///
/// Pure over its inputs: `(role, session phase, selections, whether this
/// participant already ordered a drink)`. Within the ordering stage the
/// restaurant flow comes first when a restaurant is selected; the drinks
/// step is skipped for participants who already contributed a drink item,
/// so re-entering after a remote refresh never forces a repeat step.
pub fn derive_local_phase(
    role: Role,
    session_phase: SessionPhase,
    selected_restaurant_id: Option<u32>,
    selected_drink_shop_id: Option<u32>,
    has_ordered_drinks: bool,
) -> LocalPhase {
    match session_phase {
        SessionPhase::Setup => match role {
            Role::Admin => LocalPhase::SelectingSource,
            Role::Member => LocalPhase::WaitingForSetup,
        },
        SessionPhase::SourceSelected | SessionPhase::Ordering => {
            if selected_restaurant_id.is_some() {
                LocalPhase::OrderingRestaurant
            } else if selected_drink_shop_id.is_some() && !has_ordered_drinks {
                LocalPhase::OrderingDrinks
            } else {
                LocalPhase::PersonalReview
            }
        }
        SessionPhase::ClosingOut => match role {
            Role::Admin => LocalPhase::AdminReview,
            Role::Member => LocalPhase::PersonalReview,
        },
    }
}

/// The next local phase when a participant finishes their current ordering
/// step.
///
/// `OrderingRestaurant → OrderingDrinks` only when a drink source exists
/// and this participant has not already contributed a drink item.
pub fn advance_local_phase(
    current: LocalPhase,
    drink_shop_selected: bool,
    has_ordered_drinks: bool,
) -> LocalPhase {
    match current {
        LocalPhase::OrderingRestaurant => {
            if drink_shop_selected && !has_ordered_drinks {
                LocalPhase::OrderingDrinks
            } else {
                LocalPhase::PersonalReview
            }
        }
        LocalPhase::OrderingDrinks => LocalPhase::PersonalReview,
        other => other,
    }
}

/// Validate a session-level transition requested by `role`.
///
/// Only the admin drives the shared phase, and only along the forward
/// edges of the graph.
pub fn validate_session_transition(
    role: Role,
    from: SessionPhase,
    to: SessionPhase,
    doc: &SessionDocument,
) -> Result<(), SessionError> {
    if role != Role::Admin {
        return Err(SessionError::NotAdmin {
            action: "change the session phase".into(),
        });
    }
    let allowed = matches!(
        (from, to),
        (SessionPhase::Setup, SessionPhase::SourceSelected)
            | (SessionPhase::SourceSelected, SessionPhase::Ordering)
            | (SessionPhase::SourceSelected, SessionPhase::ClosingOut)
            | (SessionPhase::Ordering, SessionPhase::ClosingOut)
    );
    if !allowed {
        return Err(SessionError::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        });
    }
    if to == SessionPhase::SourceSelected && !doc.has_source() {
        return Err(SessionError::SourceNotSelected);
    }
    Ok(())
}

/// The username-based re-authentication rule: a joiner whose display name
/// exactly matches the recorded admin name is the admin rejoining from
/// another device. This is a deliberate trust boundary — no credential is
/// involved.
pub fn is_returning_admin(display_name: &str, doc: &SessionDocument) -> bool {
    !doc.admin_name.is_empty() && display_name == doc.admin_name
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn doc_with_sources(restaurant: Option<u32>, drink: Option<u32>) -> SessionDocument {
        let mut doc = SessionDocument::new(
            "admin-1",
            "Ann",
            vec![],
            NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
        );
        doc.selected_restaurant_id = restaurant;
        doc.selected_drink_shop_id = drink;
        doc
    }

    #[test]
    fn test_setup_phase_splits_by_role() {
        assert_eq!(
            derive_local_phase(Role::Admin, SessionPhase::Setup, None, None, false),
            LocalPhase::SelectingSource
        );
        assert_eq!(
            derive_local_phase(Role::Member, SessionPhase::Setup, None, None, false),
            LocalPhase::WaitingForSetup
        );
    }

    #[test]
    fn test_ordering_prefers_restaurant_flow() {
        assert_eq!(
            derive_local_phase(Role::Member, SessionPhase::Ordering, Some(1), Some(2), false),
            LocalPhase::OrderingRestaurant
        );
    }

    #[test]
    fn test_drinks_only_session_skips_restaurant_flow() {
        assert_eq!(
            derive_local_phase(Role::Member, SessionPhase::Ordering, None, Some(2), false),
            LocalPhase::OrderingDrinks
        );
    }

    #[test]
    fn test_already_ordered_drinks_not_asked_again() {
        assert_eq!(
            derive_local_phase(Role::Member, SessionPhase::Ordering, None, Some(2), true),
            LocalPhase::PersonalReview
        );
    }

    #[test]
    fn test_closing_out_splits_by_role() {
        assert_eq!(
            derive_local_phase(Role::Admin, SessionPhase::ClosingOut, Some(1), None, false),
            LocalPhase::AdminReview
        );
        assert_eq!(
            derive_local_phase(Role::Member, SessionPhase::ClosingOut, Some(1), None, false),
            LocalPhase::PersonalReview
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        for role in [Role::Admin, Role::Member] {
            for phase in [
                SessionPhase::Setup,
                SessionPhase::SourceSelected,
                SessionPhase::Ordering,
                SessionPhase::ClosingOut,
            ] {
                for restaurant in [None, Some(1)] {
                    for drink in [None, Some(2)] {
                        for drinks_done in [false, true] {
                            let first =
                                derive_local_phase(role, phase, restaurant, drink, drinks_done);
                            let second =
                                derive_local_phase(role, phase, restaurant, drink, drinks_done);
                            assert_eq!(first, second);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_advance_from_restaurant_respects_drink_state() {
        assert_eq!(
            advance_local_phase(LocalPhase::OrderingRestaurant, true, false),
            LocalPhase::OrderingDrinks
        );
        assert_eq!(
            advance_local_phase(LocalPhase::OrderingRestaurant, true, true),
            LocalPhase::PersonalReview
        );
        assert_eq!(
            advance_local_phase(LocalPhase::OrderingRestaurant, false, false),
            LocalPhase::PersonalReview
        );
        assert_eq!(
            advance_local_phase(LocalPhase::OrderingDrinks, true, false),
            LocalPhase::PersonalReview
        );
    }

    #[test]
    fn test_members_cannot_drive_session_phase() {
        let doc = doc_with_sources(Some(1), None);
        let err = validate_session_transition(
            Role::Member,
            SessionPhase::Setup,
            SessionPhase::SourceSelected,
            &doc,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::NotAdmin { .. }));
    }

    #[test]
    fn test_source_selection_requires_a_source() {
        let doc = doc_with_sources(None, None);
        let err = validate_session_transition(
            Role::Admin,
            SessionPhase::Setup,
            SessionPhase::SourceSelected,
            &doc,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::SourceNotSelected));

        let doc = doc_with_sources(None, Some(2));
        validate_session_transition(
            Role::Admin,
            SessionPhase::Setup,
            SessionPhase::SourceSelected,
            &doc,
        )
        .unwrap();
    }

    #[test]
    fn test_backward_transitions_rejected() {
        let doc = doc_with_sources(Some(1), None);
        assert!(validate_session_transition(
            Role::Admin,
            SessionPhase::ClosingOut,
            SessionPhase::Ordering,
            &doc,
        )
        .is_err());
        assert!(validate_session_transition(
            Role::Admin,
            SessionPhase::Ordering,
            SessionPhase::Setup,
            &doc,
        )
        .is_err());
    }

    #[test]
    fn test_returning_admin_matches_exact_name() {
        let doc = doc_with_sources(None, None);
        assert!(is_returning_admin("Ann", &doc));
        assert!(!is_returning_admin("ann", &doc));
        assert!(!is_returning_admin("Ben", &doc));

        let empty = SessionDocument::from_value(serde_json::json!({})).unwrap();
        assert!(!is_returning_admin("", &empty));
    }
}
