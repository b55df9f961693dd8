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

//! Keyed, versioned storage for balances, sessions, and transactions.
//!
//! The store is the single source of truth. All balance mutation goes
//! through the idempotent delta primitives; session and transaction records
//! change only through compare-and-swap on their status. [`DashMap`] gives
//! per-key sharding, so operations for different users never contend, while
//! the per-record mutex inside [`Balance`] totally orders mutations for one
//! user.
//!
//! # Collections
//!
//! | Collection | Key | Secondary index |
//! |------------|-----|-----------------|
//! | balances | user id | — |
//! | sessions | session id | active session by user |
//! | transactions | transaction id | transaction by external ref |
//! | processed events | external event id | — |

use crate::balance::{Balance, DeltaOutcome};
use crate::base::{ExternalEventId, IdempotencyKey, SessionId, TransactionId, UserId};
use crate::error::LedgerError;
use crate::session::{ParkingSession, SessionStatus};
use crate::transaction::{PaymentTransaction, TransactionStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

/// What a reconciled external event did downstream.
///
/// Stored in the processed-events table so a replayed delivery can answer
/// without re-invoking anything.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ReconcileEffect {
    TransactionCompleted { transaction_id: TransactionId },
    TransactionFailed { transaction_id: TransactionId },
    SessionEnded { session_id: SessionId },
    /// The event arrived after its target had already reached a conflicting
    /// terminal state; nothing was mutated.
    Superseded,
}

/// In-memory ledger store.
#[derive(Debug, Default)]
pub struct LedgerStore {
    /// Minute balances indexed by user ID.
    balances: DashMap<UserId, Balance>,
    /// Session records indexed by session ID.
    sessions: DashMap<SessionId, ParkingSession>,
    /// At most one entry per user: the currently active session.
    active_by_user: DashMap<UserId, SessionId>,
    /// Transaction records indexed by transaction ID.
    transactions: DashMap<TransactionId, PaymentTransaction>,
    /// Provider payment-intent id to transaction ID.
    by_external_ref: DashMap<String, TransactionId>,
    /// Idempotency ledger for external event deliveries.
    processed_events: DashMap<ExternalEventId, ReconcileEffect>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    // === Balances ===

    /// Applies a signed delta to the user's balance, at most once per key.
    ///
    /// Creates the balance record at zero on first touch.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBalance`] if a debit would drive the
    /// balance below zero.
    pub fn apply_balance_delta(
        &self,
        user_id: &UserId,
        delta: i64,
        key: IdempotencyKey,
    ) -> Result<DeltaOutcome, LedgerError> {
        self.balances
            .entry(user_id.clone())
            .or_insert_with(|| Balance::new(user_id.clone()))
            .apply(key, delta)
    }

    /// Saturating variant for paths that must not fail on a shortfall
    /// (session close, refund clawback). Debits clamp at zero.
    pub fn apply_balance_delta_saturating(
        &self,
        user_id: &UserId,
        delta: i64,
        key: IdempotencyKey,
    ) -> DeltaOutcome {
        self.balances
            .entry(user_id.clone())
            .or_insert_with(|| Balance::new(user_id.clone()))
            .apply_saturating(key, delta)
    }

    /// Current minutes, zero for users with no balance record yet.
    pub fn balance_minutes(&self, user_id: &UserId) -> i64 {
        self.balances.get(user_id).map_or(0, |b| b.minutes())
    }

    /// Current version counter, zero for users with no balance record yet.
    pub fn balance_version(&self, user_id: &UserId) -> u64 {
        self.balances.get(user_id).map_or(0, |b| b.version())
    }

    /// Iterates over all balance records.
    pub fn balances(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, UserId, Balance>> {
        self.balances.iter()
    }

    // === Sessions ===

    /// Inserts a fresh active session, claiming the user's active slot.
    ///
    /// The active-session index is the serialization point for the
    /// one-active-session-per-user invariant: the entry API makes the
    /// check-and-claim atomic.
    ///
    /// # Errors
    ///
    /// [`LedgerError::SessionAlreadyActive`] if the user already holds an
    /// active session.
    pub fn open_session(&self, session: ParkingSession) -> Result<(), LedgerError> {
        debug_assert!(session.is_active());
        match self.active_by_user.entry(session.user_id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::SessionAlreadyActive),
            Entry::Vacant(entry) => {
                entry.insert(session.session_id);
                self.sessions.insert(session.session_id, session);
                Ok(())
            }
        }
    }

    pub fn get_session(&self, session_id: &SessionId) -> Option<ParkingSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// The user's active session, if any.
    pub fn active_session(&self, user_id: &UserId) -> Option<ParkingSession> {
        let session_id = *self.active_by_user.get(user_id)?;
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    /// Replaces a session record only if its status still matches
    /// `expected`. Terminal replacements release the user's active slot.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::SessionNotFound`] if the session does not exist.
    /// - [`LedgerError::InvalidTransition`] if the status was changed by a
    ///   concurrent writer; the caller re-reads and decides.
    pub fn put_session(
        &self,
        session_id: &SessionId,
        expected: SessionStatus,
        next: ParkingSession,
    ) -> Result<ParkingSession, LedgerError> {
        debug_assert_eq!(*session_id, next.session_id);
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or(LedgerError::SessionNotFound)?;
        if entry.status != expected {
            return Err(LedgerError::InvalidTransition);
        }
        let user_id = entry.user_id.clone();
        *entry = next.clone();
        let released = !next.is_active();
        drop(entry);

        if released {
            self.active_by_user
                .remove_if(&user_id, |_, active| *active == *session_id);
        }
        Ok(next)
    }

    // === Transactions ===

    /// Inserts a fresh transaction and indexes its external ref, if any.
    pub fn insert_transaction(&self, transaction: PaymentTransaction) {
        if let Some(external_ref) = &transaction.external_ref {
            self.by_external_ref
                .insert(external_ref.clone(), transaction.transaction_id);
        }
        let previous = self
            .transactions
            .insert(transaction.transaction_id, transaction);
        debug_assert!(previous.is_none(), "transaction IDs are generated unique");
    }

    pub fn get_transaction(&self, transaction_id: &TransactionId) -> Option<PaymentTransaction> {
        self.transactions.get(transaction_id).map(|t| t.clone())
    }

    /// Resolves a provider payment-intent id to the owning transaction.
    pub fn find_by_external_ref(&self, external_ref: &str) -> Option<PaymentTransaction> {
        let transaction_id = *self.by_external_ref.get(external_ref)?;
        self.get_transaction(&transaction_id)
    }

    /// All transactions for one user, oldest first.
    pub fn transactions_of(&self, user_id: &UserId) -> Vec<PaymentTransaction> {
        let mut transactions: Vec<PaymentTransaction> = self
            .transactions
            .iter()
            .filter(|t| t.user_id == *user_id)
            .map(|t| t.clone())
            .collect();
        transactions.sort_by_key(|t| t.created_at);
        transactions
    }

    /// Replaces a transaction record only if its status still matches
    /// `expected`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotFound`] if the transaction does not
    ///   exist.
    /// - [`LedgerError::InvalidTransition`] if the status was changed by a
    ///   concurrent writer; exactly one of two racing transitions wins.
    pub fn put_transaction(
        &self,
        transaction_id: &TransactionId,
        expected: TransactionStatus,
        next: PaymentTransaction,
    ) -> Result<PaymentTransaction, LedgerError> {
        debug_assert_eq!(*transaction_id, next.transaction_id);
        let mut entry = self
            .transactions
            .get_mut(transaction_id)
            .ok_or(LedgerError::TransactionNotFound)?;
        if entry.status != expected {
            return Err(LedgerError::InvalidTransition);
        }
        if let (None, Some(external_ref)) = (&entry.external_ref, &next.external_ref) {
            self.by_external_ref
                .insert(external_ref.clone(), *transaction_id);
        }
        *entry = next.clone();
        Ok(next)
    }

    // === External events ===

    /// Runs `apply` for this external event at most once.
    ///
    /// The vacant entry is held across the downstream dispatch, so
    /// recording the event and applying its effect form one atomic step:
    /// a second delivery of the same id either sees the recorded effect or
    /// waits until the first delivery has finished. When `apply` fails the
    /// event is not recorded and a later redelivery retries it.
    pub fn process_external_event<F>(
        &self,
        external_event_id: ExternalEventId,
        apply: F,
    ) -> Result<ProcessedEvent, LedgerError>
    where
        F: FnOnce() -> Result<ReconcileEffect, LedgerError>,
    {
        match self.processed_events.entry(external_event_id) {
            Entry::Occupied(entry) => Ok(ProcessedEvent {
                effect: *entry.get(),
                already_applied: true,
            }),
            Entry::Vacant(entry) => {
                let effect = apply()?;
                entry.insert(effect);
                Ok(ProcessedEvent {
                    effect,
                    already_applied: false,
                })
            }
        }
    }
}

/// Result of [`LedgerStore::process_external_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub effect: ReconcileEffect,
    pub already_applied: bool,
}
