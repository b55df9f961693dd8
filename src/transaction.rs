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

//! Payment transaction entity.
//!
//! Transactions follow a state machine:
//! - [`Pending`] → [`Completed`] (credits/debits the balance, exactly once)
//! - [`Pending`] → [`Failed`] or [`Cancelled`]
//!
//! `Completed`, `Failed`, and `Cancelled` are terminal; transition legality
//! is enforced here rather than by ad-hoc checks at call sites. Records are
//! never deleted: they are the audit trail.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed
//! [`Cancelled`]: TransactionStatus::Cancelled

use crate::base::{TransactionId, UserId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What the transaction does to the minute balance once completed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credits purchased minutes.
    Purchase,
    /// Claws purchased minutes back (saturating at zero).
    Refund,
    /// Records the debit of a closed session.
    Usage,
    /// Credits promotional or goodwill minutes.
    Bonus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Transfer,
    Cash,
    Card,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// One payment transaction.
///
/// `minutes` is always the positive magnitude; [`TransactionKind`] carries
/// the direction. `external_ref` holds the provider's payment-intent id and
/// is what webhook confirmations are matched against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentTransaction {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    /// `None` for usage and bonus entries, which move no money.
    pub method: Option<PaymentMethod>,
    pub amount: Decimal,
    pub minutes: i64,
    pub status: TransactionStatus,
    pub reference: Option<String>,
    pub external_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentTransaction {
    /// Creates a pending transaction.
    pub fn pending(
        user_id: UserId,
        kind: TransactionKind,
        method: Option<PaymentMethod>,
        amount: Decimal,
        minutes: i64,
        reference: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: TransactionId::generate(),
            user_id,
            kind,
            method,
            amount,
            minutes,
            status: TransactionStatus::Pending,
            reference,
            external_ref: None,
            cancel_reason: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TransactionStatus::Pending
    }

    /// Returns the completed copy of this transaction.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if already terminal.
    pub fn completed(&self, at: DateTime<Utc>) -> Result<Self, LedgerError> {
        if self.is_terminal() {
            return Err(LedgerError::InvalidTransition);
        }
        let mut tx = self.clone();
        tx.status = TransactionStatus::Completed;
        tx.completed_at = Some(at);
        Ok(tx)
    }

    /// Returns the failed copy of this transaction.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if already terminal.
    pub fn failed(&self, at: DateTime<Utc>) -> Result<Self, LedgerError> {
        if self.is_terminal() {
            return Err(LedgerError::InvalidTransition);
        }
        let mut tx = self.clone();
        tx.status = TransactionStatus::Failed;
        tx.completed_at = Some(at);
        Ok(tx)
    }

    /// Returns the cancelled copy of this transaction.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if already terminal.
    pub fn cancelled(&self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<Self, LedgerError> {
        if self.is_terminal() {
            return Err(LedgerError::InvalidTransition);
        }
        let mut tx = self.clone();
        tx.status = TransactionStatus::Cancelled;
        tx.cancel_reason = Some(reason.into());
        tx.completed_at = Some(at);
        Ok(tx)
    }

    /// Signed delta this transaction applies to the balance on completion.
    pub fn balance_delta(&self) -> i64 {
        match self.kind {
            TransactionKind::Purchase | TransactionKind::Bonus => self.minutes,
            TransactionKind::Refund | TransactionKind::Usage => -self.minutes,
        }
    }
}
