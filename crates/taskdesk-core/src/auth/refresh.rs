//! Single-flight credential refresh.
//!
//! At most one refresh cycle exists at a time. Whoever finds no active cycle
//! starts one; everyone else joins it. The start-or-join decision and the
//! park-or-proceed decision for outgoing calls are both made under one
//! synchronous lock, so no caller can slip between "no cycle active" and
//! "cycle recorded as active" across a suspension point.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::events::{SessionEvent, SignInReason};
use super::gateway::AuthGateway;
use super::queue::{PendingQueue, Replay};
use super::session::Credential;
use super::store::CredentialStore;

/// Result of one refresh cycle, shared by everyone who waited on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed(String),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed)
    }
}

type CycleReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// Failure reason when the session was signed out or replaced mid-cycle.
const SESSION_ENDED: &str = "session ended during refresh";

#[derive(Default)]
struct CycleState {
    active: Option<CycleReceiver>,
    queue: PendingQueue,
}

pub struct RefreshCoordinator {
    gateway: AuthGateway,
    store: Arc<CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<CycleState>,
    cycles_started: AtomicU64,
    self_ref: Weak<RefreshCoordinator>,
}

/// Handle for a call parked in the pending queue.
///
/// Dropping it withdraws the call if the queue hasn't drained yet, so a
/// caller that times out or is cancelled is never replayed.
pub struct PendingTicket {
    id: u64,
    coordinator: Weak<RefreshCoordinator>,
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            if coordinator.lock().queue.remove(self.id) {
                debug!(id = self.id, "Parked call withdrawn before replay");
            }
        }
    }
}

impl RefreshCoordinator {
    pub fn new(
        gateway: AuthGateway,
        store: Arc<CredentialStore>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            gateway,
            store,
            events,
            state: Mutex::new(CycleState::default()),
            cycles_started: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Number of calls currently parked.
    pub fn pending_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of refresh cycles started since construction.
    pub fn cycles_started(&self) -> u64 {
        self.cycles_started.load(Ordering::SeqCst)
    }

    /// Start a refresh, or join the one already running.
    ///
    /// The decision is made when this is called, not when the returned future
    /// is first polled.
    pub fn request_refresh(&self) -> impl Future<Output = RefreshOutcome> + Send + 'static {
        let receiver = {
            let mut state = self.lock();
            match state.active {
                Some(ref receiver) => {
                    debug!("Joining refresh already in flight");
                    receiver.clone()
                }
                None => self.start_cycle(&mut state),
            }
        };
        Self::wait(receiver)
    }

    /// Park `replay` if a refresh is running. Returns `None` when the caller
    /// should go ahead on its own.
    pub fn park_if_refreshing(&self, replay: Replay) -> Option<PendingTicket> {
        let mut state = self.lock();
        state.active.as_ref()?;
        let id = state.queue.push(replay);
        debug!(id, queued = state.queue.len(), "Refresh in flight, parking call");
        Some(self.ticket(id))
    }

    /// Park `replay` behind a refresh of the rejected `stale` credential,
    /// starting a cycle if none is running.
    ///
    /// Returns `None` without parking when no cycle is running and the store
    /// no longer holds `stale`: a cycle already finished since the caller
    /// sent its request, so it should go again with the current credential.
    pub fn park_for_refresh(&self, stale: &Credential, replay: Replay) -> Option<PendingTicket> {
        let mut state = self.lock();
        if state.active.is_none() {
            if self.store.credential().as_ref() != Some(stale) {
                debug!("Credential rotated since the request was sent, not refreshing");
                return None;
            }
            self.start_cycle(&mut state);
        }
        let id = state.queue.push(replay);
        debug!(id, queued = state.queue.len(), "Call parked pending refresh");
        Some(self.ticket(id))
    }

    /// Drop the session after the server rejected a credential that was just
    /// refreshed. Returns whether anything was cleared.
    pub fn invalidate(&self, reason: SignInReason) -> bool {
        if self.store.clear() {
            warn!(?reason, "Session invalidated");
            let _ = self.events.send(SessionEvent::SignInRequired { reason });
            true
        } else {
            false
        }
    }

    fn ticket(&self, id: u64) -> PendingTicket {
        PendingTicket {
            id,
            coordinator: self.self_ref.clone(),
        }
    }

    /// Record a new active cycle and spawn it. Caller holds the state lock.
    fn start_cycle(&self, state: &mut CycleState) -> CycleReceiver {
        let (tx, rx) = watch::channel(None);
        state.active = Some(rx.clone());
        let cycle = self.cycles_started.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.store.generation();
        info!(cycle, "Starting credential refresh");

        match self.self_ref.upgrade() {
            Some(this) => {
                // Runs detached so a requester giving up can't leave the cycle active forever.
                tokio::spawn(async move { this.run_cycle(cycle, generation, tx).await });
            }
            None => {
                // Only reachable while the coordinator is being dropped.
                state.active = None;
                let _ = tx.send(Some(RefreshOutcome::Failed("coordinator shut down".to_string())));
            }
        }
        rx
    }

    async fn run_cycle(
        self: Arc<Self>,
        cycle: u64,
        generation: u64,
        tx: watch::Sender<Option<RefreshOutcome>>,
    ) {
        let outcome = match self.gateway.refresh().await {
            Ok(credential) => {
                if self.store.set_credential_if_current(generation, credential) {
                    info!(cycle, "Credential refresh succeeded");
                    let _ = self.events.send(SessionEvent::Refreshed);
                    RefreshOutcome::Refreshed
                } else {
                    info!(cycle, "Session ended during refresh, discarding new credential");
                    RefreshOutcome::Failed(SESSION_ENDED.to_string())
                }
            }
            Err(e) => {
                warn!(cycle, error = %e, "Credential refresh failed");
                if self.store.clear_if_current(generation) {
                    let _ = self.events.send(SessionEvent::SignInRequired {
                        reason: SignInReason::RefreshFailed,
                    });
                }
                RefreshOutcome::Failed(e.to_string())
            }
        };

        // Close the cycle and take the queue in one step: calls arriving from
        // here on go straight to the network with the new credential.
        let pending = {
            let mut state = self.lock();
            state.active = None;
            state.queue.drain()
        };
        tx.send_replace(Some(outcome.clone()));

        if !pending.is_empty() {
            debug!(cycle, count = pending.len(), success = outcome.is_success(), "Draining parked calls");
        }
        for call in pending {
            (call.replay)(outcome.clone()).await;
        }
    }

    async fn wait(mut receiver: CycleReceiver) -> RefreshOutcome {
        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| RefreshOutcome::Failed("refresh produced no outcome".to_string())),
            Err(_) => RefreshOutcome::Failed("refresh task ended unexpectedly".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::Credential;
    use crate::storage::MemoryStore;
    use futures::FutureExt;

    /// Coordinator whose refresh endpoint is unreachable, so every cycle fails fast.
    fn coordinator() -> (Arc<RefreshCoordinator>, Arc<CredentialStore>, broadcast::Receiver<SessionEvent>) {
        let store = Arc::new(CredentialStore::new(Arc::new(MemoryStore::new())));
        let (tx, rx) = broadcast::channel(16);
        let gateway = AuthGateway::new(reqwest::Client::new(), "http://127.0.0.1:1", "http://localhost");
        (RefreshCoordinator::new(gateway, store.clone(), tx), store, rx)
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_cycle() {
        let (coordinator, _store, _rx) = coordinator();

        let first = coordinator.request_refresh();
        assert!(coordinator.is_refreshing());
        let second = coordinator.request_refresh();
        let third = coordinator.request_refresh();

        let (a, b, c) = tokio::join!(first, second, third);
        assert_eq!(coordinator.cycles_started(), 1);
        assert!(!a.is_success());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_cycle_clears_session_and_signals_once() {
        let (coordinator, store, mut rx) = coordinator();
        store.set_credential(Credential::new("stale"));

        let outcome = coordinator.request_refresh().await;
        assert!(!outcome.is_success());
        assert_eq!(store.credential(), None);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::RefreshFailed }
        );

        // A second failing cycle has nothing left to clear
        coordinator.request_refresh().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_park_if_refreshing_only_parks_during_cycle() {
        let (coordinator, _store, _rx) = coordinator();
        let noop: Replay = Box::new(|_| async {}.boxed());
        assert!(coordinator.park_if_refreshing(noop).is_none());

        let refresh = coordinator.request_refresh();
        let noop: Replay = Box::new(|_| async {}.boxed());
        let ticket = coordinator.park_if_refreshing(noop).unwrap();
        assert_eq!(coordinator.pending_len(), 1);

        drop(ticket);
        assert_eq!(coordinator.pending_len(), 0);
        refresh.await;
    }

    #[tokio::test]
    async fn test_park_for_refresh_skips_rotated_credential() {
        let (coordinator, store, _rx) = coordinator();
        store.set_credential(Credential::new("current"));

        let noop: Replay = Box::new(|_| async {}.boxed());
        assert!(coordinator
            .park_for_refresh(&Credential::new("older"), noop)
            .is_none());
        assert_eq!(coordinator.cycles_started(), 0);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_parked_calls_receive_failure_in_order() {
        let (coordinator, store, _rx) = coordinator();
        let stale = Credential::new("stale");
        store.set_credential(stale.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut tickets = Vec::new();
        for name in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            let replay: Replay = Box::new(move |outcome| {
                async move {
                    seen.lock().unwrap().push((name, outcome.is_success()));
                }
                .boxed()
            });
            tickets.push(coordinator.park_for_refresh(&stale, replay).unwrap());
        }
        assert_eq!(coordinator.cycles_started(), 1);

        // Joining after the calls guarantees the drain has started
        coordinator.request_refresh().await;
        while seen.lock().unwrap().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![("a", false), ("b", false), ("c", false)]);
    }

    #[tokio::test]
    async fn test_invalidate_signals_only_when_cleared() {
        let (coordinator, store, mut rx) = coordinator();
        assert!(!coordinator.invalidate(SignInReason::Unauthorized));

        store.set_credential(Credential::new("rejected"));
        assert!(coordinator.invalidate(SignInReason::Unauthorized));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::SignInRequired { reason: SignInReason::Unauthorized }
        );
    }
}
