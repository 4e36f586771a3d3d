//! Connection state machine for the remote billing channel.
//!
//! # Purpose
//! Owns the channel lifecycle, gates when the pending queue may drain, and
//! fans failure out to every still-pending request. The channel itself is
//! opaque and can die out from under the client at any time; the machine's
//! job is to keep that survivable.
//!
//! # Design notes
//! Every transition must appear in the static predecessor table; an illegal
//! transition is a programming error and panics. All state mutation happens
//! under one mutex, but side effects (connector calls, queue fan-out,
//! purchase-event registration) are collected while locked and executed
//! after release, so no caller-supplied code ever runs under the lock.
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use till_common::{RequestKind, Response, ResponseCode};
use tracing::{debug, warn};

use crate::client::context::ExecutionContext;
use crate::client::queue::PendingQueue;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Static legality table: the states each state may be entered from.
    /// `Initial` is the start state and has no legal predecessor. There is
    /// no terminal state; `Disconnected` and `Failed` are both left via a
    /// fresh `Connecting` transition.
    pub fn legal_predecessors(self) -> &'static [ConnectionState] {
        match self {
            ConnectionState::Initial => &[],
            ConnectionState::Connecting => &[
                ConnectionState::Initial,
                ConnectionState::Disconnected,
                ConnectionState::Failed,
            ],
            ConnectionState::Connected => &[ConnectionState::Connecting],
            ConnectionState::Disconnecting => &[ConnectionState::Connected],
            ConnectionState::Disconnected => &[
                ConnectionState::Disconnecting,
                // disconnect() while still connecting short-circuits; there
                // is no channel to close yet.
                ConnectionState::Connecting,
            ],
            ConnectionState::Failed => &[ConnectionState::Connecting],
        }
    }
}

/// One synchronous call's worth of context handed to the channel.
#[derive(Clone, Debug)]
pub struct RemoteCall {
    pub request_id: u64,
    pub kind: RequestKind,
    pub api_version: u32,
    pub args: Bytes,
}

/// The live, bound channel to the out-of-process billing service.
///
/// The channel has no correlation of its own; the caller must never have
/// two calls outstanding at once (the queue worker guarantees this).
pub trait ChannelProxy: Send + Sync {
    fn call(&self, call: RemoteCall) -> till_common::Result<Response>;

    /// Close the channel. Safe to call more than once.
    fn close(&self) {}
}

/// Capability that asynchronously opens and tears down the channel.
pub trait Connector: Send + Sync {
    /// Begin opening the channel. `true` means the attempt started and a
    /// `channel_changed` callback will follow; `false` means the attempt
    /// was refused synchronously and no callback will come.
    fn connect(&self, events: &ChannelEvents) -> bool;

    fn disconnect(&self);
}

/// External "purchases changed" notification source. Registrations are
/// identified by handles so re-registration is well-defined.
pub trait PurchaseEvents: Send + Sync {
    fn register(&self) -> u64;

    fn deregister(&self, registration: u64);
}

/// Default sink for clients that do not observe purchase changes.
pub struct NoopPurchaseEvents;

impl PurchaseEvents for NoopPurchaseEvents {
    fn register(&self) -> u64 {
        0
    }

    fn deregister(&self, _registration: u64) {}
}

/// Purchase-events registration slot. `Pending` is reserved under the
/// same locked section that enters CONNECTED, so a concurrent teardown
/// knows a register call is still in flight and must undo itself.
#[derive(Debug, Eq, PartialEq)]
enum Registration {
    Idle,
    Pending,
    Active(u64),
}

struct Core {
    state: ConnectionState,
    proxy: Option<Arc<dyn ChannelProxy>>,
    registration: Registration,
}

impl Core {
    /// Move to `next`, panicking on any transition outside the table.
    fn transition(&mut self, next: ConnectionState) {
        assert!(
            next.legal_predecessors().contains(&self.state),
            "illegal connection transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "connection transition");
        self.state = next;
    }
}

/// Side effects owed by a transition, executed after the state lock drops.
enum Effect {
    OpenChannel,
    /// Close one channel. Also used for a superseded attempt's late
    /// delivery, so it must not touch the connector binding.
    CloseChannel(Arc<dyn ChannelProxy>),
    /// Tear down the connector binding; explicit disconnect only.
    DisconnectConnector,
    Register,
    Deregister(u64),
    Drain,
    FailPending,
    CancelPending,
}

pub(crate) struct Connection {
    core: Mutex<Core>,
    connector: Arc<dyn Connector>,
    purchase_events: Arc<dyn PurchaseEvents>,
    queue: Arc<PendingQueue>,
    worker: ExecutionContext,
    main: ExecutionContext,
}

impl Connection {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        purchase_events: Arc<dyn PurchaseEvents>,
        queue: Arc<PendingQueue>,
        worker: ExecutionContext,
        main: ExecutionContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(Core {
                state: ConnectionState::Initial,
                proxy: None,
                registration: Registration::Idle,
            }),
            connector,
            purchase_events,
            queue,
            worker,
            main,
        })
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock_core().state
    }

    /// Proxy snapshot, present only while CONNECTED. The drain loop calls
    /// this before every entry so a teardown mid-drain pauses the queue.
    pub(crate) fn live_proxy(&self) -> Option<Arc<dyn ChannelProxy>> {
        let core = self.lock_core();
        match core.state {
            ConnectionState::Connected => core.proxy.clone(),
            _ => None,
        }
    }

    /// Ensure a connection is established. Idempotent: already CONNECTED
    /// just re-triggers a drain, an in-flight CONNECTING attempt is left
    /// alone, anything else starts a fresh attempt.
    pub(crate) fn connect(self: &Arc<Self>) {
        let mut effects = Vec::new();
        {
            let mut core = self.lock_core();
            match core.state {
                ConnectionState::Connected => effects.push(Effect::Drain),
                ConnectionState::Connecting => {}
                // DISCONNECTING is traversed inside one locked section and
                // is never observable here; keep the arm explicit anyway.
                ConnectionState::Disconnecting => {}
                ConnectionState::Initial
                | ConnectionState::Disconnected
                | ConnectionState::Failed => {
                    core.transition(ConnectionState::Connecting);
                    effects.push(Effect::OpenChannel);
                }
            }
        }
        self.run_effects(effects);
    }

    /// Explicit teardown. Cancels all pending entries in every active
    /// branch: a request submitted before or during this call must not
    /// silently survive into a future reconnection.
    pub(crate) fn disconnect(self: &Arc<Self>) {
        let mut effects = Vec::new();
        {
            let mut core = self.lock_core();
            match core.state {
                ConnectionState::Initial
                | ConnectionState::Disconnected
                | ConnectionState::Disconnecting => {}
                ConnectionState::Failed => {
                    // State stays FAILED; no further attempt is implied, so
                    // nothing queued may linger.
                    effects.push(Effect::CancelPending);
                }
                ConnectionState::Connected => {
                    core.transition(ConnectionState::Disconnecting);
                    match std::mem::replace(&mut core.registration, Registration::Idle) {
                        Registration::Active(registration) => {
                            effects.push(Effect::Deregister(registration));
                        }
                        // An in-flight register call finds its slot gone
                        // when it completes and undoes itself.
                        Registration::Pending | Registration::Idle => {}
                    }
                    if let Some(proxy) = core.proxy.take() {
                        effects.push(Effect::CloseChannel(proxy));
                    }
                    effects.push(Effect::DisconnectConnector);
                    core.transition(ConnectionState::Disconnected);
                    effects.push(Effect::CancelPending);
                }
                ConnectionState::Connecting => {
                    // No channel to close yet.
                    core.transition(ConnectionState::Disconnected);
                    effects.push(Effect::CancelPending);
                }
            }
        }
        self.run_effects(effects);
    }

    /// Inbound report from the connector or the raw channel itself.
    pub(crate) fn channel_changed(
        self: &Arc<Self>,
        proxy: Option<Arc<dyn ChannelProxy>>,
        is_connect_attempt: bool,
    ) {
        let mut effects = Vec::new();
        {
            let mut core = self.lock_core();
            if is_connect_attempt {
                if core.state != ConnectionState::Connecting {
                    // A late callback from a superseded attempt. The channel
                    // cannot belong to the current state; close it.
                    if let Some(proxy) = proxy {
                        warn!(
                            state = ?core.state,
                            "stale connect callback; closing delivered channel"
                        );
                        effects.push(Effect::CloseChannel(proxy));
                    }
                } else {
                    match proxy {
                        Some(proxy) => {
                            core.transition(ConnectionState::Connected);
                            core.proxy = Some(proxy);
                            assert_eq!(
                                core.registration,
                                Registration::Idle,
                                "purchase events already registered"
                            );
                            // Reserve the slot before the lock drops so a
                            // racing teardown sees the in-flight register.
                            core.registration = Registration::Pending;
                            effects.push(Effect::Register);
                            effects.push(Effect::Drain);
                        }
                        None => {
                            core.transition(ConnectionState::Failed);
                            assert_eq!(
                                core.registration,
                                Registration::Idle,
                                "purchase events still registered entering FAILED"
                            );
                            effects.push(Effect::FailPending);
                        }
                    }
                }
            } else {
                match core.state {
                    ConnectionState::Initial
                    | ConnectionState::Disconnected
                    | ConnectionState::Failed => {
                        // A torn-down channel reporting closure again is
                        // expected noise.
                        debug!(state = ?core.state, "ignoring channel closure report");
                    }
                    ConnectionState::Connected => {
                        // The channel died on its own; pass through
                        // DISCONNECTING so deregistration happens exactly
                        // once, then settle in DISCONNECTED. Queued entries
                        // stay put for the next connect.
                        core.transition(ConnectionState::Disconnecting);
                        match std::mem::replace(&mut core.registration, Registration::Idle) {
                            Registration::Active(registration) => {
                                effects.push(Effect::Deregister(registration));
                            }
                            Registration::Pending | Registration::Idle => {}
                        }
                        core.proxy = None;
                        core.transition(ConnectionState::Disconnected);
                    }
                    ConnectionState::Connecting => {
                        // The channel never became usable.
                        core.transition(ConnectionState::Failed);
                        assert_eq!(
                            core.registration,
                            Registration::Idle,
                            "purchase events still registered entering FAILED"
                        );
                        effects.push(Effect::FailPending);
                    }
                    ConnectionState::Disconnecting => {
                        unreachable!("DISCONNECTING is never observable outside the state lock")
                    }
                }
            }
        }
        self.run_effects(effects);
    }

    /// Refusal reported synchronously by the connector (its `connect`
    /// returned false): the attempt never started.
    fn connect_refused(self: &Arc<Self>) {
        let mut effects = Vec::new();
        {
            let mut core = self.lock_core();
            if core.state == ConnectionState::Connecting {
                core.transition(ConnectionState::Failed);
                effects.push(Effect::FailPending);
            }
        }
        self.run_effects(effects);
    }

    fn run_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenChannel => {
                    // The connector talks to platform services that may
                    // require the main context.
                    let connection = Arc::clone(self);
                    self.main.post(move || {
                        let events = ChannelEvents::new(&connection);
                        if !connection.connector.connect(&events) {
                            connection.connect_refused();
                        }
                    });
                }
                Effect::CloseChannel(proxy) => {
                    self.main.post(move || proxy.close());
                }
                Effect::DisconnectConnector => {
                    let connector = Arc::clone(&self.connector);
                    self.main.post(move || connector.disconnect());
                }
                Effect::Register => {
                    let registration = self.purchase_events.register();
                    let kept = {
                        let mut core = self.lock_core();
                        if core.state == ConnectionState::Connected
                            && core.registration == Registration::Pending
                        {
                            core.registration = Registration::Active(registration);
                            true
                        } else {
                            false
                        }
                    };
                    if !kept {
                        // The connection moved on while register was in
                        // flight; this registration must not outlive it.
                        debug!(registration, "registration superseded; deregistering");
                        self.purchase_events.deregister(registration);
                    }
                }
                Effect::Deregister(registration) => {
                    self.purchase_events.deregister(registration);
                }
                Effect::Drain => {
                    let connection = Arc::clone(self);
                    self.worker.post(move || {
                        let provider = {
                            let connection = Arc::clone(&connection);
                            move || connection.live_proxy()
                        };
                        connection.queue.run(&provider);
                    });
                }
                Effect::FailPending => {
                    self.queue.fail_all(ResponseCode::ChannelNotConnected);
                }
                Effect::CancelPending => {
                    self.queue.cancel_all();
                }
            }
        }
    }
}

/// Inbound callback handle handed to the connector. Holds the connection
/// weakly so a dropped client detaches late callbacks.
#[derive(Clone)]
pub struct ChannelEvents {
    connection: Weak<Connection>,
}

impl ChannelEvents {
    pub(crate) fn new(connection: &Arc<Connection>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
        }
    }

    /// Report a new live channel (`is_connect_attempt` true, from the
    /// connector) or the loss of the current one (`false`, from the channel
    /// itself).
    pub fn channel_changed(
        &self,
        proxy: Option<Arc<dyn ChannelProxy>>,
        is_connect_attempt: bool,
    ) {
        match self.connection.upgrade() {
            Some(connection) => connection.channel_changed(proxy, is_connect_attempt),
            None => debug!("channel report after client drop; ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_lists_only_reachable_predecessors() {
        use ConnectionState::*;
        assert!(Initial.legal_predecessors().is_empty());
        for state in [Connecting, Connected, Disconnecting, Disconnected, Failed] {
            assert!(!state.legal_predecessors().is_empty());
            assert!(
                !state.legal_predecessors().contains(&state),
                "{state:?} must not be its own predecessor"
            );
        }
    }

    #[test]
    fn legal_sequence_walks_the_table() {
        let mut core = Core {
            state: ConnectionState::Initial,
            proxy: None,
            registration: Registration::Idle,
        };
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Failed,
            ConnectionState::Connecting,
        ] {
            core.transition(next);
            assert_eq!(core.state, next);
        }
    }

    #[test]
    #[should_panic(expected = "illegal connection transition")]
    fn illegal_transition_is_fatal() {
        let mut core = Core {
            state: ConnectionState::Initial,
            proxy: None,
            registration: Registration::Idle,
        };
        core.transition(ConnectionState::Connected);
    }

    #[test]
    #[should_panic(expected = "illegal connection transition")]
    fn nothing_reenters_initial() {
        let mut core = Core {
            state: ConnectionState::Disconnected,
            proxy: None,
            registration: Registration::Idle,
        };
        core.transition(ConnectionState::Initial);
    }
}
