pub mod catalog;
pub mod config;
pub mod connection;
pub mod controller;
pub mod errors;
pub mod order;
pub mod session;
pub mod store;
pub mod sync;

pub use config::{CanteenConfig, DeadlineSettings, SyncSettings};
pub use connection::{ConnectionMonitor, ConnectionState};
pub use controller::{ControllerSnapshot, ParticipantSession, SessionController};
pub use errors::{SessionError, StoreError, SyncError};
pub use order::{HistoricalOrder, HistoryIndex};
pub use session::{
    LocalPhase, OrderItem, Participant, ParticipantOrder, Role, SessionDocument, SessionPhase,
    StoreKind,
};
pub use store::{DocumentStore, MemoryStore};
pub use sync::{DocumentFeed, ReadResult, SyncClient, WriteOutcome};
