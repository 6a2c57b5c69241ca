//! Keeps the transport's subscription set equal to the desired set.
//!
//! [`SubscriptionReconciler`] owns the active set exclusively. Callers hand
//! it the full desired set each time; it works out the difference and
//! issues at most one unsubscribe and one subscribe call. Every transition
//! into [`ConnectionState::Connected`] starts from an empty active set and
//! replays the whole desired set, because the transport forgets
//! subscriptions across connection cycles.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::models::{InstrumentKey, SubscriptionMode};
use crate::transport::{ConnectionState, TransportAdapter};

/// What a reconcile round actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Instruments newly subscribed, sorted.
    pub subscribed: Vec<InstrumentKey>,
    /// Instruments unsubscribed, sorted.
    pub unsubscribed: Vec<InstrumentKey>,
    /// Instruments the transport refused in this round.
    pub rejected: Vec<InstrumentKey>,
    /// Transport calls were held back until the next connect.
    pub deferred: bool,
}

impl ReconcileOutcome {
    /// Returns `true` if no transport call was made or needed.
    pub fn is_noop(&self) -> bool {
        self.subscribed.is_empty()
            && self.unsubscribed.is_empty()
            && self.rejected.is_empty()
            && !self.deferred
    }

    fn deferred() -> Self {
        Self {
            deferred: true,
            ..Self::default()
        }
    }
}

/// Diffs desired against active subscriptions and drives the transport.
pub struct SubscriptionReconciler<T> {
    transport: T,
    mode: SubscriptionMode,
    state: ConnectionState,
    desired: HashSet<InstrumentKey>,
    active: HashSet<InstrumentKey>,
    /// Refused by the transport; not requested again while still desired.
    rejected: HashSet<InstrumentKey>,
}

impl<T: TransportAdapter> SubscriptionReconciler<T> {
    /// Creates a reconciler in the `Disconnected` state with nothing desired.
    pub fn new(transport: T, mode: SubscriptionMode) -> Self {
        Self {
            transport,
            mode,
            state: ConnectionState::Disconnected,
            desired: HashSet::new(),
            active: HashSet::new(),
            rejected: HashSet::new(),
        }
    }

    /// Replaces the desired set and brings the transport in line with it.
    ///
    /// Calling this again with an unchanged set makes no transport call.
    /// While not connected only the bookkeeping changes; the transport is
    /// driven on the next transition into `Connected`.
    pub fn reconcile(&mut self, desired: HashSet<InstrumentKey>) -> ReconcileOutcome {
        // Leaving the desired set clears the rejection, so re-adding retries.
        self.rejected.retain(|key| desired.contains(key));
        self.desired = desired;

        if self.state != ConnectionState::Connected {
            debug!(
                state = self.state.as_str(),
                desired = self.desired.len(),
                "Deferring subscription changes until connected"
            );
            return ReconcileOutcome::deferred();
        }

        self.sync()
    }

    /// Applies a connection lifecycle change.
    ///
    /// Entering `Connected` replays the full desired set. Any other state
    /// clears the active set, since the transport drops subscriptions with
    /// the connection.
    pub fn on_connection_state_change(&mut self, state: ConnectionState) -> ReconcileOutcome {
        let previous = std::mem::replace(&mut self.state, state);
        info!(
            from = previous.as_str(),
            to = state.as_str(),
            "Connection state changed"
        );

        self.active.clear();
        match state {
            ConnectionState::Connected => self.sync(),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                ReconcileOutcome::deferred()
            }
        }
    }

    /// Records a rejection the transport reported after the subscribe call
    /// returned. Returns the instruments dropped from tracking.
    pub fn on_subscribe_rejected(
        &mut self,
        instruments: &[InstrumentKey],
        reason: &str,
    ) -> Vec<InstrumentKey> {
        let mut dropped = Vec::new();
        for key in instruments {
            self.active.remove(key);
            if self.desired.contains(key) && self.rejected.insert(key.clone()) {
                dropped.push(key.clone());
            }
        }

        if !dropped.is_empty() {
            warn!(count = dropped.len(), %reason, "Subscription rejected by transport");
        }
        dropped
    }

    fn sync(&mut self) -> ReconcileOutcome {
        let mut to_add: Vec<InstrumentKey> = self
            .desired
            .iter()
            .filter(|key| !self.active.contains(*key) && !self.rejected.contains(*key))
            .cloned()
            .collect();
        let mut to_remove: Vec<InstrumentKey> = self
            .active
            .iter()
            .filter(|key| !self.desired.contains(*key))
            .cloned()
            .collect();

        if to_add.is_empty() && to_remove.is_empty() {
            return ReconcileOutcome::default();
        }
        to_add.sort();
        to_remove.sort();

        let mut outcome = ReconcileOutcome::default();

        if !to_remove.is_empty() {
            for key in &to_remove {
                self.active.remove(key);
            }
            if let Err(e) = self.transport.unsubscribe(&to_remove, self.mode) {
                warn!(count = to_remove.len(), "Unsubscribe failed: {e}");
            }
            outcome.unsubscribed = to_remove;
        }

        if !to_add.is_empty() {
            match self.transport.subscribe(&to_add, self.mode) {
                Ok(()) => {
                    self.active.extend(to_add.iter().cloned());
                    outcome.subscribed = to_add;
                }
                Err(TransportError::Rejected {
                    instruments,
                    reason,
                }) => {
                    let refused: HashSet<InstrumentKey> = instruments.into_iter().collect();
                    let (rejected, accepted): (Vec<_>, Vec<_>) =
                        to_add.into_iter().partition(|key| refused.contains(key));
                    warn!(
                        rejected = rejected.len(),
                        accepted = accepted.len(),
                        %reason,
                        "Transport rejected part of a subscribe request"
                    );
                    self.active.extend(accepted.iter().cloned());
                    self.rejected.extend(rejected.iter().cloned());
                    outcome.subscribed = accepted;
                    outcome.rejected = rejected;
                }
                Err(TransportError::Unavailable(reason)) => {
                    warn!(%reason, "Transport unavailable, subscribe waits for reconnect");
                    outcome.deferred = true;
                }
            }
        }

        info!(
            subscribed = outcome.subscribed.len(),
            unsubscribed = outcome.unsubscribed.len(),
            rejected = outcome.rejected.len(),
            active = self.active.len(),
            "Reconciled subscriptions"
        );
        outcome
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn desired(&self) -> &HashSet<InstrumentKey> {
        &self.desired
    }

    pub fn active(&self) -> &HashSet<InstrumentKey> {
        &self.active
    }

    pub fn rejected(&self) -> &HashSet<InstrumentKey> {
        &self.rejected
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
