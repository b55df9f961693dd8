// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Parking ledger engine.
//!
//! The [`Engine`] is the central component: it processes purchases and
//! refunds, opens and meters parking sessions, reconciles external event
//! deliveries, and serves the read-only user view. All state lives in the
//! [`LedgerStore`]; the engine holds no copies.
//!
//! # Processing
//!
//! - **Purchases**: transfer/cash purchases stay pending until confirmed;
//!   card purchases authorize synchronously and credit immediately.
//! - **Sessions**: opening checks the minimum balance and claims the user's
//!   single active slot; closing meters elapsed minutes and debits once,
//!   keyed by the session id.
//! - **Reconciliation**: webhook and guard-scan deliveries apply at most
//!   once, keyed by external event id.
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync` and processes requests for different users in
//! parallel; per-user mutations are totally ordered by the store.

use crate::base::{
    ExternalEventId, IdempotencyKey, LocationId, PackageId, SessionId, TransactionId, UserId,
};
use crate::catalog::{Catalog, StaticCatalog};
use crate::clock::{Clock, SystemClock};
use crate::error::LedgerError;
use crate::gateway::{PaymentGateway, StaticGateway};
use crate::notify::{NotificationEvent, NotificationQueue};
use crate::policy::Policy;
use crate::session::{EndedBy, ParkingSession, SessionStatus};
use crate::store::{LedgerStore, ReconcileEffect};
use crate::transaction::{PaymentMethod, PaymentTransaction, TransactionKind, TransactionStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Externally delivered confirmation, already verified by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcilePayload {
    /// Provider confirmed a payment intent.
    PaymentConfirmed { external_ref: String },
    /// Provider reported a payment intent as failed.
    PaymentFailed { external_ref: String },
    /// A guard device scanned the session QR at the exit.
    GuardExit { session_id: SessionId },
}

/// Result of reconciling one external event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First delivery: the effect was applied now.
    Applied(ReconcileEffect),
    /// Replayed delivery: nothing was re-applied.
    AlreadyApplied(ReconcileEffect),
}

/// Read-only combined view for client display.
///
/// May be slightly stale under concurrent writes; never used for mutation
/// decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserView {
    pub user_id: UserId,
    pub minutes: i64,
    pub version: u64,
    pub active_session: Option<ParkingSession>,
    pub low_balance: bool,
    pub critical_balance: bool,
}

/// One row of the balance report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMinutes {
    pub user_id: UserId,
    pub minutes: i64,
    pub version: u64,
}

/// Parking ledger engine over a [`LedgerStore`].
pub struct Engine {
    store: LedgerStore,
    catalog: Arc<dyn Catalog>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    policy: Policy,
    notifications: NotificationQueue,
}

impl Engine {
    pub fn new(catalog: Arc<dyn Catalog>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            store: LedgerStore::new(),
            catalog,
            gateway,
            clock: Arc::new(SystemClock),
            policy: Policy::default(),
            notifications: NotificationQueue::new(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Pending notification events; drained by the dispatcher.
    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    // === Transaction Processor ===

    /// Starts a purchase of a catalog package.
    ///
    /// Transfer and cash purchases are created `pending` and credit nothing
    /// until confirmed. Card purchases drive a synchronous authorization
    /// round trip and credit immediately when approved.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::PackageNotFound`] - unknown package id.
    /// - [`LedgerError::PaymentAuthDenied`] - card authorization declined;
    ///   a `failed` transaction is recorded for the audit trail.
    pub fn initiate_purchase(
        &self,
        user_id: UserId,
        package_id: &PackageId,
        method: PaymentMethod,
        reference: Option<String>,
    ) -> Result<PaymentTransaction, LedgerError> {
        let package = self
            .catalog
            .package(package_id)
            .ok_or(LedgerError::PackageNotFound)?;
        if package.minutes <= 0 {
            return Err(LedgerError::InvalidMinutes);
        }

        let mut transaction = PaymentTransaction::pending(
            user_id,
            TransactionKind::Purchase,
            Some(method),
            package.price,
            package.minutes,
            reference.clone(),
            self.clock.now(),
        );

        match method {
            PaymentMethod::Transfer | PaymentMethod::Cash => {
                info!(
                    transaction = %transaction.transaction_id,
                    user = %transaction.user_id,
                    package = %package_id,
                    "purchase pending confirmation"
                );
                self.store.insert_transaction(transaction.clone());
                Ok(transaction)
            }
            PaymentMethod::Card => {
                let authorization = self.gateway.authorize_card(
                    package.price,
                    &self.policy.currency,
                    reference.as_deref().unwrap_or_default(),
                )?;
                transaction.external_ref = Some(authorization.external_ref);

                if !authorization.approved {
                    let failed = transaction.failed(self.clock.now())?;
                    self.store.insert_transaction(failed);
                    return Err(LedgerError::PaymentAuthDenied);
                }

                self.store.insert_transaction(transaction.clone());
                self.settle(&transaction.transaction_id)
            }
        }
    }

    /// Transitions a pending transaction to `completed` and applies its
    /// balance delta exactly once.
    ///
    /// Idempotent: completing an already-completed transaction returns the
    /// stored record without re-crediting.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - already failed or cancelled.
    pub fn complete_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<PaymentTransaction, LedgerError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;

        match transaction.status {
            TransactionStatus::Completed => {
                debug!(transaction = %transaction_id, "already completed, replay is a no-op");
                Ok(transaction)
            }
            TransactionStatus::Pending => self.settle(transaction_id),
            TransactionStatus::Failed | TransactionStatus::Cancelled => {
                Err(LedgerError::InvalidTransition)
            }
        }
    }

    /// Cancels a pending transaction. No balance effect.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - already terminal, including
    ///   losing the race against a concurrent completion.
    pub fn cancel_transaction(
        &self,
        transaction_id: &TransactionId,
        reason: impl Into<String>,
    ) -> Result<PaymentTransaction, LedgerError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;
        let cancelled = transaction.cancelled(reason, self.clock.now())?;
        let stored =
            self.store
                .put_transaction(transaction_id, TransactionStatus::Pending, cancelled)?;
        info!(transaction = %transaction_id, "transaction cancelled");
        Ok(stored)
    }

    /// Marks a pending transaction as failed (provider reported failure).
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - already terminal.
    pub fn fail_transaction(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<PaymentTransaction, LedgerError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;
        let failed = transaction.failed(self.clock.now())?;
        let stored =
            self.store
                .put_transaction(transaction_id, TransactionStatus::Pending, failed)?;
        info!(transaction = %transaction_id, "transaction failed");
        Ok(stored)
    }

    /// Creates a pending refund mirroring a completed purchase. Completing
    /// it claws the purchased minutes back, saturating at zero.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - the original is not a
    ///   completed purchase.
    pub fn initiate_refund(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<PaymentTransaction, LedgerError> {
        let original = self
            .store
            .get_transaction(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;
        if original.kind != TransactionKind::Purchase
            || original.status != TransactionStatus::Completed
        {
            return Err(LedgerError::InvalidTransition);
        }

        let refund = PaymentTransaction::pending(
            original.user_id.clone(),
            TransactionKind::Refund,
            original.method,
            original.amount,
            original.minutes,
            Some(transaction_id.to_string()),
            self.clock.now(),
        );
        self.store.insert_transaction(refund.clone());
        info!(
            refund = %refund.transaction_id,
            original = %transaction_id,
            "refund pending"
        );
        Ok(refund)
    }

    /// Credits promotional minutes as an immediately-completed `bonus`
    /// transaction.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidMinutes`] if `minutes` is not positive.
    pub fn grant_bonus(
        &self,
        user_id: UserId,
        minutes: i64,
        reference: impl Into<String>,
    ) -> Result<PaymentTransaction, LedgerError> {
        if minutes <= 0 {
            return Err(LedgerError::InvalidMinutes);
        }
        let bonus = PaymentTransaction::pending(
            user_id,
            TransactionKind::Bonus,
            None,
            Decimal::ZERO,
            minutes,
            Some(reference.into()),
            self.clock.now(),
        );
        self.store.insert_transaction(bonus.clone());
        self.settle(&bonus.transaction_id)
    }

    /// Wins the pending → completed transition, then applies the balance
    /// delta keyed by the transaction id.
    ///
    /// The CAS decides the winner of a complete/cancel race before any
    /// money moves; the idempotency key keeps retries from double-applying.
    fn settle(&self, transaction_id: &TransactionId) -> Result<PaymentTransaction, LedgerError> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;
        let completed = transaction.completed(self.clock.now())?;

        let stored = match self.store.put_transaction(
            transaction_id,
            TransactionStatus::Pending,
            completed,
        ) {
            Ok(stored) => stored,
            Err(LedgerError::InvalidTransition) => {
                // Lost the race. A concurrent completion is a no-op replay;
                // anything else is a genuine dead end.
                let current = self
                    .store
                    .get_transaction(transaction_id)
                    .ok_or(LedgerError::TransactionNotFound)?;
                if current.status == TransactionStatus::Completed {
                    debug!(transaction = %transaction_id, "lost completion race, replaying");
                    return Ok(current);
                }
                return Err(LedgerError::InvalidTransition);
            }
            Err(other) => return Err(other),
        };

        let key = IdempotencyKey::from(transaction_id);
        let delta = stored.balance_delta();
        let outcome = if delta >= 0 {
            self.store
                .apply_balance_delta(&stored.user_id, delta, key)?
        } else {
            // Refund clawback must not fail on spent minutes.
            self.store
                .apply_balance_delta_saturating(&stored.user_id, delta, key)
        };

        info!(
            transaction = %transaction_id,
            user = %stored.user_id,
            delta,
            balance = outcome.new_balance,
            "transaction completed"
        );
        self.check_low_balance(&stored.user_id, outcome.new_balance);
        Ok(stored)
    }

    // === Session Engine ===

    /// Opens a parking session for the user.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::SessionAlreadyActive`]
    /// - [`LedgerError::InsufficientBalance`] - balance below the start
    ///   minimum; the caller should offer the purchase flow.
    pub fn start_session(
        &self,
        user_id: UserId,
        location: LocationId,
        spot: Option<String>,
    ) -> Result<ParkingSession, LedgerError> {
        if self.store.balance_minutes(&user_id) < self.policy.min_start_minutes {
            return Err(LedgerError::InsufficientBalance);
        }

        let session = ParkingSession::open(user_id, location, spot, self.clock.now());
        self.store.open_session(session.clone())?;
        info!(
            session = %session.session_id,
            user = %session.user_id,
            location = %session.location,
            "session started"
        );
        Ok(session)
    }

    /// The user's active session, if any. Pure read.
    pub fn get_active_session(&self, user_id: &UserId) -> Option<ParkingSession> {
        self.store.active_session(user_id)
    }

    /// Closes a session, metering elapsed minutes and debiting the balance
    /// exactly once.
    ///
    /// Idempotent on the session id: a duplicate close (guard double-scan)
    /// returns the already-completed record without a second debit. A
    /// balance shortfall never blocks the close; the uncovered minutes are
    /// recorded on the session.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::SessionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - the session was cancelled.
    pub fn end_session(
        &self,
        session_id: &SessionId,
        ended_by: EndedBy,
    ) -> Result<ParkingSession, LedgerError> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or(LedgerError::SessionNotFound)?;
        match session.status {
            SessionStatus::Completed => {
                debug!(session = %session_id, "already completed, replay is a no-op");
                return Ok(session);
            }
            SessionStatus::Cancelled => return Err(LedgerError::InvalidTransition),
            SessionStatus::Active => {}
        }

        let now = self.clock.now();
        let duration_minutes = session.elapsed_minutes(now);
        let rate = self.policy.rate_per_minute(&session.location);
        let cost = Decimal::from(duration_minutes) * rate;

        // Debit before the CAS, keyed by the session id: no matter how many
        // closers race, the minutes move once.
        let outcome = self.store.apply_balance_delta_saturating(
            &session.user_id,
            -duration_minutes,
            IdempotencyKey::from(session_id),
        );
        let shortfall_minutes = (duration_minutes - outcome.applied_minutes).max(0);

        let completed =
            session.completed(now, duration_minutes, cost, shortfall_minutes, ended_by)?;
        let stored = match self
            .store
            .put_session(session_id, SessionStatus::Active, completed)
        {
            Ok(stored) => stored,
            Err(LedgerError::InvalidTransition) => {
                // A concurrent closer won; both callers observe its record.
                let current = self
                    .store
                    .get_session(session_id)
                    .ok_or(LedgerError::SessionNotFound)?;
                if current.status == SessionStatus::Completed {
                    debug!(session = %session_id, "lost close race, replaying");
                    return Ok(current);
                }
                return Err(LedgerError::InvalidTransition);
            }
            Err(other) => return Err(other),
        };

        if shortfall_minutes > 0 {
            warn!(
                session = %session_id,
                user = %stored.user_id,
                shortfall_minutes,
                "session closed with uncovered minutes"
            );
        }

        // Audit the debit. Exactly one closer reaches this point.
        let usage = PaymentTransaction {
            status: TransactionStatus::Completed,
            completed_at: Some(now),
            ..PaymentTransaction::pending(
                stored.user_id.clone(),
                TransactionKind::Usage,
                None,
                cost,
                duration_minutes,
                Some(session_id.to_string()),
                now,
            )
        };
        self.store.insert_transaction(usage);

        info!(
            session = %session_id,
            user = %stored.user_id,
            duration_minutes,
            balance = outcome.new_balance,
            "session completed"
        );
        self.notifications.publish(NotificationEvent::SessionEnded {
            user_id: stored.user_id.clone(),
            session_id: *session_id,
            duration_minutes,
            cost,
            shortfall_minutes,
        });
        self.check_low_balance(&stored.user_id, outcome.new_balance);
        Ok(stored)
    }

    /// Cancels an active session before any billing. No balance effect.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::SessionNotFound`]
    /// - [`LedgerError::InvalidTransition`] - already terminal.
    pub fn cancel_session(&self, session_id: &SessionId) -> Result<ParkingSession, LedgerError> {
        let session = self
            .store
            .get_session(session_id)
            .ok_or(LedgerError::SessionNotFound)?;
        let cancelled = session.cancelled(self.clock.now())?;
        let stored = self
            .store
            .put_session(session_id, SessionStatus::Active, cancelled)?;
        info!(session = %session_id, "session cancelled");
        Ok(stored)
    }

    // === Reconciliation Coordinator ===

    /// Applies one external event delivery at most once.
    ///
    /// A replayed delivery returns [`Outcome::AlreadyApplied`] without
    /// touching the downstream engines. Recording the event and applying
    /// its effect happen in one atomic step, so a redelivery can never
    /// observe the event as processed while its effect is missing.
    ///
    /// An event that arrives after its target reached a conflicting
    /// terminal state (a failure webhook for an already-completed payment)
    /// is recorded as superseded rather than surfaced as an incident.
    pub fn reconcile(
        &self,
        external_event_id: ExternalEventId,
        payload: ReconcilePayload,
    ) -> Result<Outcome, LedgerError> {
        let processed = self
            .store
            .process_external_event(external_event_id.clone(), || self.dispatch(&payload))?;

        if processed.already_applied {
            debug!(event = %external_event_id, "external event replayed");
            Ok(Outcome::AlreadyApplied(processed.effect))
        } else {
            Ok(Outcome::Applied(processed.effect))
        }
    }

    fn dispatch(&self, payload: &ReconcilePayload) -> Result<ReconcileEffect, LedgerError> {
        match payload {
            ReconcilePayload::PaymentConfirmed { external_ref } => {
                let transaction = self
                    .store
                    .find_by_external_ref(external_ref)
                    .ok_or(LedgerError::TransactionNotFound)?;
                match self.complete_transaction(&transaction.transaction_id) {
                    Ok(completed) => Ok(ReconcileEffect::TransactionCompleted {
                        transaction_id: completed.transaction_id,
                    }),
                    Err(LedgerError::InvalidTransition) => Ok(ReconcileEffect::Superseded),
                    Err(other) => Err(other),
                }
            }
            ReconcilePayload::PaymentFailed { external_ref } => {
                let transaction = self
                    .store
                    .find_by_external_ref(external_ref)
                    .ok_or(LedgerError::TransactionNotFound)?;
                match self.fail_transaction(&transaction.transaction_id) {
                    Ok(failed) => Ok(ReconcileEffect::TransactionFailed {
                        transaction_id: failed.transaction_id,
                    }),
                    Err(LedgerError::InvalidTransition) => Ok(ReconcileEffect::Superseded),
                    Err(other) => Err(other),
                }
            }
            ReconcilePayload::GuardExit { session_id } => {
                match self.end_session(session_id, EndedBy::Guard) {
                    Ok(session) => Ok(ReconcileEffect::SessionEnded {
                        session_id: session.session_id,
                    }),
                    Err(LedgerError::InvalidTransition) => Ok(ReconcileEffect::Superseded),
                    Err(other) => Err(other),
                }
            }
        }
    }

    // === Balance Query Facade ===

    /// Combined read-only view for client display.
    pub fn user_view(&self, user_id: &UserId) -> UserView {
        let minutes = self.store.balance_minutes(user_id);
        UserView {
            user_id: user_id.clone(),
            minutes,
            version: self.store.balance_version(user_id),
            active_session: self.store.active_session(user_id),
            low_balance: minutes < self.policy.low_balance_minutes,
            critical_balance: minutes < self.policy.critical_balance_minutes,
        }
    }

    /// Snapshot of every known balance, for reporting.
    pub fn user_minutes(&self) -> Vec<UserMinutes> {
        self.store
            .balances()
            .map(|balance| UserMinutes {
                user_id: balance.key().clone(),
                minutes: balance.minutes(),
                version: balance.version(),
            })
            .collect()
    }

    /// Session record by id. Pure read.
    pub fn get_session(&self, session_id: &SessionId) -> Option<ParkingSession> {
        self.store.get_session(session_id)
    }

    /// Transaction record by id. Pure read.
    pub fn get_transaction(&self, transaction_id: &TransactionId) -> Option<PaymentTransaction> {
        self.store.get_transaction(transaction_id)
    }

    /// The user's transaction history, oldest first. Pure read.
    pub fn transactions_of(&self, user_id: &UserId) -> Vec<PaymentTransaction> {
        self.store.transactions_of(user_id)
    }

    fn check_low_balance(&self, user_id: &UserId, minutes: i64) {
        if minutes < self.policy.low_balance_minutes {
            self.notifications.publish(NotificationEvent::LowBalance {
                user_id: user_id.clone(),
                minutes,
            });
        }
    }
}

impl Default for Engine {
    /// Engine with the stock catalog, the deterministic gateway, and the
    /// system clock.
    fn default() -> Self {
        Self::new(
            Arc::new(StaticCatalog::standard()),
            Arc::new(StaticGateway::new()),
        )
    }
}
