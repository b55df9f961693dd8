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

//! Error types for ledger operations.

use thiserror::Error;

/// Ledger operation errors.
///
/// `InvalidTransition` is an expected outcome under concurrent or duplicate
/// delivery (two guards racing to close the same session, a webhook retrying
/// a completed payment) and is not an incident. A successful replay is not
/// an error at all; it is reported through `Outcome::AlreadyApplied`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Balance would drop below zero, or is below the start minimum
    #[error("insufficient minute balance")]
    InsufficientBalance,

    /// User already has an active parking session
    #[error("user already has an active session")]
    SessionAlreadyActive,

    /// Referenced session ID does not exist
    #[error("session not found")]
    SessionNotFound,

    /// Referenced transaction ID does not exist
    #[error("transaction not found")]
    TransactionNotFound,

    /// Illegal state-machine edge (entity is already terminal, or the
    /// expected state was lost to a concurrent writer)
    #[error("invalid state transition")]
    InvalidTransition,

    /// Package ID is not in the catalog
    #[error("package not found")]
    PackageNotFound,

    /// Card authorization was declined by the payment provider
    #[error("payment authorization denied")]
    PaymentAuthDenied,

    /// Entity belongs to a different user than the caller claimed
    #[error("entity does not belong to this user")]
    UserMismatch,

    /// Minute amount is zero or negative where a positive credit is required
    #[error("invalid minute amount (must be positive)")]
    InvalidMinutes,

    /// Transient storage failure; retry with backoff and re-query state
    /// before assuming the mutation did not commit
    #[error("ledger store unavailable")]
    StoreUnavailable,
}
