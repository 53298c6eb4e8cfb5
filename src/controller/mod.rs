//! Session controller: the orchestration root on each client.
//!
//! The controller is the only component that translates between local
//! optimistic state and the shared document. It:
//! - subscribes to the session document and pumps every remote change
//!   through reconciliation and phase re-derivation
//! - applies user actions optimistically, then issues the matching
//!   merge-write
//! - keeps the exact payload of a failed write so `retry_sync` can replay
//!   it, and exposes degraded/offline status to the UI
//!
//! State lives behind one mutex and is never held across an await; remote
//! I/O happens strictly before or after the critical section.

use crate::config::DeadlineSettings;
use crate::connection::ConnectionMonitor;
use crate::errors::SessionError;
use crate::order::{self, HistoricalOrder};
use crate::session::deadline::DeadlineWatcher;
use crate::session::document::{
    patch_closed, patch_deadline, patch_participant_order, patch_participants, patch_phase,
    patch_sources, OrderItem, Participant, ParticipantOrder, SessionDocument, SessionPhase,
    StoreKind,
};
use crate::session::phase::{
    advance_local_phase, derive_local_phase, is_returning_admin, validate_session_transition,
    LocalPhase, Role,
};
use crate::session::session_key;
use crate::store::Document;
use crate::sync::{ReadResult, SyncClient};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connected client's own view of itself. Owned exclusively by its
/// controller, never persisted verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSession {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub local_phase: LocalPhase,
    pub session_id: String,
    /// Optimistic view of this client's own contribution; converges to
    /// `per_participant_orders[id].items` in the shared document.
    pub local_items: Vec<OrderItem>,
}

impl ParticipantSession {
    fn has_ordered_drinks(&self) -> bool {
        self.local_items
            .iter()
            .any(|item| item.store_kind == StoreKind::Drink)
    }
}

/// The reactive pair handed to the UI layer on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub session: Option<SessionDocument>,
    pub local: ParticipantSession,
    /// True while the connection is down or offline writes await replay.
    pub degraded: bool,
    pub last_sync_error: Option<String>,
}

struct ControllerState {
    me: ParticipantSession,
    doc: Option<SessionDocument>,
    /// Output of the last phase derivation; local state only moves when a
    /// new derivation differs from this.
    last_derived: Option<LocalPhase>,
    /// Payload of the last exhausted-retry write, replayed by `retry_sync`.
    failed_write: Option<Document>,
    last_sync_error: Option<String>,
    watcher: DeadlineWatcher,
}

pub struct SessionController {
    sync: SyncClient,
    session_id: String,
    key: String,
    state: Arc<Mutex<ControllerState>>,
    snapshot_tx: watch::Sender<ControllerSnapshot>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session_id", &self.session_id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a brand-new session with this client as admin.
    ///
    /// Fails with `NotJoinable` if an active session already exists under
    /// `session_id`; finalization removes the document, so the normal
    /// day-to-day flow always starts from an absent key.
    pub async fn create_session(
        sync: SyncClient,
        deadline_settings: DeadlineSettings,
        session_id: &str,
        admin_name: &str,
        roster: Vec<Participant>,
        order_date: NaiveDate,
    ) -> Result<Self, SessionError> {
        let admin_name = admin_name.trim();
        if admin_name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        let key = session_key(session_id);
        if sync.read(&key).await?.into_document().is_some() {
            return Err(SessionError::NotJoinable {
                session_id: session_id.to_string(),
                reason: "an active session already exists".into(),
            });
        }

        // An admin already on the roster keeps their roster identity.
        let admin_id = roster
            .iter()
            .find(|p| p.name == admin_name)
            .map(|p| p.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let doc = SessionDocument::new(admin_id.clone(), admin_name, roster, order_date);
        let value = doc.to_value().map_err(store_err)?;
        sync.write_merge(&key, value).await?;

        let me = ParticipantSession {
            id: admin_id,
            display_name: admin_name.to_string(),
            role: Role::Admin,
            local_phase: LocalPhase::SelectingSource,
            session_id: session_id.to_string(),
            local_items: Vec::new(),
        };
        Ok(Self::spawn(
            sync,
            deadline_settings,
            session_id,
            me,
            Some(doc),
        ))
    }

    /// Join an existing session.
    ///
    /// A joiner whose display name exactly matches the recorded admin name
    /// is the admin returning from another device and keeps admin
    /// privileges. Unknown names are added to the participants roster ad
    /// hoc. A missing or closed session is `NotJoinable` — an answer, not
    /// a network error.
    pub async fn join_session(
        sync: SyncClient,
        deadline_settings: DeadlineSettings,
        session_id: &str,
        display_name: &str,
    ) -> Result<Self, SessionError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        let key = session_key(session_id);
        let raw = match sync.read(&key).await? {
            ReadResult::Fresh(Some(doc)) | ReadResult::Cached(Some(doc)) => doc,
            ReadResult::Fresh(None) | ReadResult::Cached(None) | ReadResult::NoData => {
                return Err(SessionError::NotJoinable {
                    session_id: session_id.to_string(),
                    reason: "session not found".into(),
                });
            }
        };
        let doc = SessionDocument::from_value(raw).map_err(store_err)?;
        if doc.is_closed {
            return Err(SessionError::NotJoinable {
                session_id: session_id.to_string(),
                reason: "already closed".into(),
            });
        }

        let returning_admin = is_returning_admin(display_name, &doc);
        let (id, role) = if returning_admin {
            (doc.admin_id.clone(), Role::Admin)
        } else if let Some(existing) = doc.participant_named(display_name) {
            (existing.id.clone(), Role::Member)
        } else {
            (Uuid::new_v4().to_string(), Role::Member)
        };

        let mut doc = doc;
        if doc.participant_named(display_name).is_none() && !returning_admin {
            doc.participants.push(Participant {
                id: id.clone(),
                name: display_name.to_string(),
            });
            sync.write_merge(&key, patch_participants(&doc.participants))
                .await?;
        }

        let local_items = doc.items_of(&id).to_vec();
        let local_phase = derive_local_phase(
            role,
            doc.phase,
            doc.selected_restaurant_id,
            doc.selected_drink_shop_id,
            doc.has_ordered_drinks(&id),
        );
        let me = ParticipantSession {
            id,
            display_name: display_name.to_string(),
            role,
            local_phase,
            session_id: session_id.to_string(),
            local_items,
        };
        Ok(Self::spawn(
            sync,
            deadline_settings,
            session_id,
            me,
            Some(doc),
        ))
    }

    fn spawn(
        sync: SyncClient,
        deadline_settings: DeadlineSettings,
        session_id: &str,
        me: ParticipantSession,
        doc: Option<SessionDocument>,
    ) -> Self {
        let key = session_key(session_id);
        let last_derived = Some(me.local_phase);
        let state = Arc::new(Mutex::new(ControllerState {
            me,
            doc,
            last_derived,
            failed_write: None,
            last_sync_error: None,
            watcher: DeadlineWatcher::new(deadline_settings),
        }));

        let initial = {
            let state = state.lock().expect("controller state lock");
            build_snapshot(&sync, &state)
        };
        let (snapshot_tx, _) = watch::channel(initial);

        let pump = {
            let sync = sync.clone();
            let key = key.clone();
            let state = state.clone();
            let snapshot_tx = snapshot_tx.clone();
            tokio::spawn(async move {
                let mut feed = sync.subscribe(&key);
                while let Some(raw) = feed.next().await {
                    handle_remote(&sync, &key, &state, &snapshot_tx, raw);
                }
            })
        };

        Self {
            sync,
            session_id: session_id.to_string(),
            key,
            state,
            snapshot_tx,
            pump,
        }
    }

    // ── Reactive surface ─────────────────────────────────────────────

    pub fn participant(&self) -> ParticipantSession {
        self.state.lock().expect("controller state lock").me.clone()
    }

    pub fn session(&self) -> Option<SessionDocument> {
        self.state.lock().expect("controller state lock").doc.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Reactive `(ParticipantSession, SessionDocument)` pair for the UI.
    pub fn subscribe_updates(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn connection(&self) -> &Arc<ConnectionMonitor> {
        self.sync.monitor()
    }

    // ── Admin actions ────────────────────────────────────────────────

    /// Choose the ordering sources. At least one of restaurant and drink
    /// shop is required; moves the session to `SourceSelected`.
    pub async fn select_source(
        &self,
        restaurant_id: Option<u32>,
        drink_shop_id: Option<u32>,
    ) -> Result<(), SessionError> {
        if restaurant_id.is_none() && drink_shop_id.is_none() {
            return Err(SessionError::SourceNotSelected);
        }
        {
            let mut state = self.state.lock().expect("controller state lock");
            let role = state.me.role;
            let doc = active_doc_mut(&mut state)?;
            if doc.phase == SessionPhase::Setup {
                let mut candidate = doc.clone();
                candidate.selected_restaurant_id = restaurant_id;
                candidate.selected_drink_shop_id = drink_shop_id;
                validate_session_transition(
                    role,
                    SessionPhase::Setup,
                    SessionPhase::SourceSelected,
                    &candidate,
                )?;
            } else if role != Role::Admin {
                return Err(SessionError::NotAdmin {
                    action: "select the ordering sources".into(),
                });
            }
            doc.selected_restaurant_id = restaurant_id;
            doc.selected_drink_shop_id = drink_shop_id;
            doc.phase = SessionPhase::SourceSelected;
            recompute_locked(&self.sync, &self.key, &mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        self.write_with_recovery(patch_sources(restaurant_id, drink_shop_id))
            .await
    }

    /// Open the ordering stage.
    pub async fn start_ordering(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().expect("controller state lock");
            let role = state.me.role;
            let doc = active_doc_mut(&mut state)?;
            validate_session_transition(role, doc.phase, SessionPhase::Ordering, doc)?;
            doc.phase = SessionPhase::Ordering;
            recompute_locked(&self.sync, &self.key, &mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        self.write_with_recovery(patch_phase(SessionPhase::Ordering))
            .await
    }

    /// Move the session to `ClosingOut` once every order is collected.
    pub async fn close_ordering(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().expect("controller state lock");
            let role = state.me.role;
            let doc = active_doc_mut(&mut state)?;
            validate_session_transition(role, doc.phase, SessionPhase::ClosingOut, doc)?;
            doc.phase = SessionPhase::ClosingOut;
            recompute_locked(&self.sync, &self.key, &mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        self.write_with_recovery(patch_phase(SessionPhase::ClosingOut))
            .await
    }

    /// End ordering early. `is_closed` can never be unset again within
    /// this session.
    pub async fn close_early(&self) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock().expect("controller state lock");
            require_admin(&state, "close the session early")?;
            let doc = active_doc_mut(&mut state)?;
            doc.is_closed = true;
            doc.phase = SessionPhase::ClosingOut;
            recompute_locked(&self.sync, &self.key, &mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        self.write_with_recovery(patch_closed()).await
    }

    /// Set (or replace) the ordering deadline. The only code path that
    /// resets `deadline_reached`.
    pub async fn set_deadline(&self, when: DateTime<Utc>) -> Result<(), SessionError> {
        if when <= Utc::now() {
            return Err(SessionError::InvalidDeadline(
                "deadline must be in the future".into(),
            ));
        }
        {
            let mut state = self.state.lock().expect("controller state lock");
            require_admin(&state, "set the deadline")?;
            let doc = active_doc_mut(&mut state)?;
            doc.deadline = Some(when);
            doc.deadline_reached = false;
            recompute_locked(&self.sync, &self.key, &mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        self.write_with_recovery(patch_deadline(when)).await
    }

    /// Add a team member ad hoc during the session.
    pub async fn add_participant(&self, name: &str) -> Result<Participant, SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        let (participant, patch) = {
            let mut state = self.state.lock().expect("controller state lock");
            require_admin(&state, "add participants")?;
            let doc = active_doc_mut(&mut state)?;
            if let Some(existing) = doc.participant_named(name) {
                return Ok(existing.clone());
            }
            let participant = Participant {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
            };
            doc.participants.push(participant.clone());
            let patch = patch_participants(&doc.participants);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
            (participant, patch)
        };
        self.write_with_recovery(patch).await?;
        Ok(participant)
    }

    /// Admin in `ClosingOut`: switch back to the personal summary view.
    pub fn reopen_summary(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().expect("controller state lock");
        require_admin(&state, "reopen the personal summary")?;
        let doc = active_doc(&state)?;
        if doc.phase != SessionPhase::ClosingOut {
            return Err(SessionError::InvalidTransition {
                from: format!("{:?}", doc.phase),
                to: "PersonalReview".into(),
            });
        }
        state.me.local_phase = LocalPhase::PersonalReview;
        self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        Ok(())
    }

    /// Finalize: archive the session and clear the active document.
    pub async fn finalize(&self) -> Result<Option<HistoricalOrder>, SessionError> {
        {
            let state = self.state.lock().expect("controller state lock");
            require_admin(&state, "finalize the session")?;
        }
        let snapshot = order::finalize(&self.sync, &self.session_id).await?;
        {
            let mut state = self.state.lock().expect("controller state lock");
            state.me.local_items.clear();
            state.doc = None;
            state.watcher.disarm();
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        Ok(snapshot)
    }

    // ── Participant actions ──────────────────────────────────────────

    /// Add one unit of a menu item to this participant's order.
    ///
    /// Appended optimistically, then the whole updated entry is rewritten
    /// remotely — the store has no array-append primitive, and a full-list
    /// rewrite stays idempotent when a timed-out attempt lands late.
    pub async fn add_item(
        &self,
        catalog_id: u32,
        name: &str,
        unit_price: u32,
        store_kind: StoreKind,
        customizations: Option<String>,
    ) -> Result<OrderItem, SessionError> {
        let (item, patch) = {
            let mut state = self.state.lock().expect("controller state lock");
            require_ordering_open(&state)?;
            let item = OrderItem::new(catalog_id, name, unit_price, store_kind, customizations);
            state.me.local_items.push(item.clone());
            let patch = own_order_patch(&mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
            (item, patch)
        };
        self.write_with_recovery(patch).await?;
        Ok(item)
    }

    /// Remove exactly one previously added instance. Unknown ids are a
    /// no-op: the instance may already be gone from a remote echo.
    pub async fn remove_item(&self, instance_id: Uuid) -> Result<(), SessionError> {
        let patch = {
            let mut state = self.state.lock().expect("controller state lock");
            require_ordering_open(&state)?;
            if order::remove_instance(&mut state.me.local_items, instance_id).is_none() {
                return Ok(());
            }
            let patch = own_order_patch(&mut state);
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
            patch
        };
        self.write_with_recovery(patch).await
    }

    /// Finish the current ordering step (restaurant → drinks → review).
    pub fn advance_phase(&self) -> Result<LocalPhase, SessionError> {
        let mut state = self.state.lock().expect("controller state lock");
        let doc = active_doc(&state)?;
        let drink_selected = doc.selected_drink_shop_id.is_some();
        let next = advance_local_phase(
            state.me.local_phase,
            drink_selected,
            state.me.has_ordered_drinks(),
        );
        if next != state.me.local_phase {
            state.me.local_phase = next;
            self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        }
        Ok(next)
    }

    // ── Failure recovery ─────────────────────────────────────────────

    /// Replay the last failed merge payload and any journaled offline
    /// writes. The payload is byte-identical to the original attempt.
    pub async fn retry_sync(&self) -> Result<(), SessionError> {
        let replay = {
            let mut state = self.state.lock().expect("controller state lock");
            state.failed_write.take()
        };
        if replay.is_none() && self.sync.pending_count() == 0 {
            return Err(SessionError::NothingToRetry);
        }

        if let Some(patch) = replay {
            if let Err(err) = self.sync.write_merge(&self.key, patch.clone()).await {
                let mut state = self.state.lock().expect("controller state lock");
                state.failed_write = Some(patch);
                state.last_sync_error = Some(err.to_string());
                self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
                return Err(err.into());
            }
        }
        self.sync.flush_pending().await?;

        let mut state = self.state.lock().expect("controller state lock");
        state.last_sync_error = None;
        self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
        Ok(())
    }

    async fn write_with_recovery(&self, patch: Document) -> Result<(), SessionError> {
        match self.sync.write_merge(&self.key, patch.clone()).await {
            Ok(_) => {
                let mut state = self.state.lock().expect("controller state lock");
                state.last_sync_error = None;
                self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "write failed after retries, keeping payload for replay");
                let mut state = self.state.lock().expect("controller state lock");
                state.failed_write = Some(patch);
                state.last_sync_error = Some(err.to_string());
                self.snapshot_tx.send_replace(build_snapshot(&self.sync, &state));
                Err(err.into())
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

// ── Remote-change handling ───────────────────────────────────────────

fn handle_remote(
    sync: &SyncClient,
    key: &str,
    state: &Arc<Mutex<ControllerState>>,
    snapshot_tx: &watch::Sender<ControllerSnapshot>,
    raw: Option<Document>,
) {
    let parsed = match raw {
        Some(value) => match SessionDocument::from_value(value) {
            Ok(doc) => Some(doc),
            Err(err) => {
                warn!(error = %err, "ignoring malformed session document");
                return;
            }
        },
        None => None,
    };

    let mut state = state.lock().expect("controller state lock");
    state.doc = parsed;
    if state.doc.is_none() {
        // Session cleared (finalized elsewhere): nothing left to hold.
        state.me.local_items.clear();
        state.watcher.disarm();
    } else {
        reconcile_locked(sync, key, &mut state);
        recompute_locked(sync, key, &mut state);
    }
    snapshot_tx.send_replace(build_snapshot(sync, &state));
}

/// Reconcile optimistic local items toward the remote document.
///
/// Last-remote-write wins for one's own entry: only the owning participant
/// writes that key in normal operation, so a differing remote value is
/// either our own echo or a deliberate external edit. Journaled offline
/// writes keep local state authoritative until replayed.
fn reconcile_locked(sync: &SyncClient, key: &str, state: &mut ControllerState) {
    let Some(doc) = &state.doc else { return };
    if sync.has_pending(key) {
        return;
    }
    if let Some(entry) = doc.per_participant_orders.get(&state.me.id) {
        if entry.items != state.me.local_items {
            debug!(
                local = state.me.local_items.len(),
                remote = entry.items.len(),
                "adopting remote items for own order"
            );
            state.me.local_items = entry.items.clone();
        }
    }
}

/// Re-derive the local phase and keep the deadline watcher in step with
/// the document. Local phase only moves when the derivation output
/// changes — redundant remote echoes cause no transition.
fn recompute_locked(sync: &SyncClient, key: &str, state: &mut ControllerState) {
    let Some(doc) = &state.doc else { return };

    if state.me.role == Role::Member && is_returning_admin(&state.me.display_name, doc) {
        state.me.role = Role::Admin;
    }

    let has_drinks = state.me.has_ordered_drinks() || doc.has_ordered_drinks(&state.me.id);
    let derived = derive_local_phase(
        state.me.role,
        doc.phase,
        doc.selected_restaurant_id,
        doc.selected_drink_shop_id,
        has_drinks,
    );
    if state.last_derived != Some(derived) {
        debug!(?derived, "local phase re-derived");
        state.last_derived = Some(derived);
        state.me.local_phase = derived;
    }

    match doc.deadline {
        Some(when) if !doc.deadline_reached && !doc.is_closed => {
            state
                .watcher
                .arm(sync.clone(), key.to_string(), when);
        }
        _ => state.watcher.disarm(),
    }
}

fn build_snapshot(sync: &SyncClient, state: &ControllerState) -> ControllerSnapshot {
    ControllerSnapshot {
        session: state.doc.clone(),
        local: state.me.clone(),
        degraded: !sync.monitor().current().is_connected || sync.pending_count() > 0,
        last_sync_error: state.last_sync_error.clone(),
    }
}

fn own_order_patch(state: &mut ControllerState) -> Document {
    let order = ParticipantOrder {
        display_name: state.me.display_name.clone(),
        items: state.me.local_items.clone(),
    };
    if let Some(doc) = &mut state.doc {
        doc.per_participant_orders
            .insert(state.me.id.clone(), order.clone());
    }
    patch_participant_order(&state.me.id, &order)
}

fn active_doc(state: &ControllerState) -> Result<&SessionDocument, SessionError> {
    state.doc.as_ref().ok_or(SessionError::NotJoinable {
        session_id: String::new(),
        reason: "no active session".into(),
    })
}

fn active_doc_mut(state: &mut ControllerState) -> Result<&mut SessionDocument, SessionError> {
    state.doc.as_mut().ok_or(SessionError::NotJoinable {
        session_id: String::new(),
        reason: "no active session".into(),
    })
}

fn require_admin(state: &ControllerState, action: &str) -> Result<(), SessionError> {
    if state.me.role != Role::Admin {
        return Err(SessionError::NotAdmin {
            action: action.to_string(),
        });
    }
    Ok(())
}

/// Item-mutating actions are allowed only in an open ordering window:
/// a source chosen, the session not closed, the deadline not reached.
fn require_ordering_open(state: &ControllerState) -> Result<(), SessionError> {
    let doc = active_doc(state)?;
    if doc.is_closed || doc.phase == SessionPhase::ClosingOut {
        return Err(SessionError::SessionClosed);
    }
    if doc.deadline_reached {
        return Err(SessionError::DeadlineClosed);
    }
    if !doc.has_source() {
        return Err(SessionError::SourceNotSelected);
    }
    Ok(())
}

fn store_err(err: serde_json::Error) -> SessionError {
    SessionError::Sync(crate::errors::StoreError::from(err).into())
}
