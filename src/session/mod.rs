//! The shared session document and the rules that govern it.
//!
//! `document` holds the replicated `SessionDocument` shape plus patch
//! builders for every field group a writer owns; `phase` is the state
//! machine deriving each participant's local phase from shared state;
//! `deadline` is the wall-clock watcher that flips `deadline_reached`.

pub mod deadline;
pub mod document;
pub mod phase;

pub use deadline::DeadlineWatcher;
pub use document::{
    OrderItem, Participant, ParticipantOrder, SessionDocument, SessionPhase, StoreKind,
};
pub use phase::{derive_local_phase, is_returning_admin, LocalPhase, Role};

/// Store key of the active session document for `session_id`.
pub fn session_key(session_id: &str) -> String {
    format!("sessions/{session_id}")
}
