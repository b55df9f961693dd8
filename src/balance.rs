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

//! Per-user minute balance.
//!
//! All mutation goes through [`Balance::apply`] / [`Balance::apply_saturating`]
//! with an idempotency key; a replayed key returns the recorded outcome
//! without re-mutating. The record is the unit of per-user serialization:
//! one mutex, held only for the duration of a point mutation.
//!
//! # Example
//!
//! ```
//! use parking_ledger_rs::{Balance, IdempotencyKey, UserId};
//!
//! let balance = Balance::new(UserId::new("u-1"));
//! balance.apply(IdempotencyKey::new("purchase-1"), 60).unwrap();
//! assert_eq!(balance.minutes(), 60);
//! ```

use crate::base::{IdempotencyKey, UserId};
use crate::error::LedgerError;
use parking_lot::Mutex;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::collections::HashMap;

/// Result of one delta application (or its replay).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Balance after the delta (or the balance recorded when the key first
    /// applied, on replay).
    pub new_balance: i64,
    /// Version after the delta.
    pub version: u64,
    /// `false` if the key had already been applied and nothing was mutated.
    pub applied: bool,
    /// Magnitude of minutes actually moved. Differs from `delta.abs()` only
    /// when a saturating debit was clamped at zero.
    pub applied_minutes: i64,
}

/// Outcome recorded per idempotency key so replays can answer consistently.
#[derive(Debug, Clone, Copy)]
struct DeltaRecord {
    new_balance: i64,
    version: u64,
    applied_minutes: i64,
}

#[derive(Debug)]
struct BalanceData {
    user_id: UserId,
    minutes: i64,
    version: u64,
    /// Applied deltas indexed by idempotency key for replay lookup.
    applied: HashMap<IdempotencyKey, DeltaRecord>,
}

impl BalanceData {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            minutes: 0,
            version: 0,
            applied: HashMap::new(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.minutes >= 0,
            "Invariant violated: minute balance went negative: {}",
            self.minutes
        );
    }

    fn replay(&self, key: &IdempotencyKey) -> Option<DeltaOutcome> {
        self.applied.get(key).map(|record| DeltaOutcome {
            new_balance: record.new_balance,
            version: record.version,
            applied: false,
            applied_minutes: record.applied_minutes,
        })
    }

    fn commit(&mut self, key: IdempotencyKey, moved: i64) -> DeltaOutcome {
        self.minutes += moved;
        self.version += 1;
        self.assert_invariants();

        let record = DeltaRecord {
            new_balance: self.minutes,
            version: self.version,
            applied_minutes: moved.abs(),
        };
        self.applied.insert(key, record);

        DeltaOutcome {
            new_balance: record.new_balance,
            version: record.version,
            applied: true,
            applied_minutes: record.applied_minutes,
        }
    }
}

/// Minute balance for one user.
#[derive(Debug)]
pub struct Balance {
    inner: Mutex<BalanceData>,
}

impl Balance {
    pub fn new(user_id: UserId) -> Self {
        Self {
            inner: Mutex::new(BalanceData::new(user_id)),
        }
    }

    pub fn minutes(&self) -> i64 {
        self.inner.lock().minutes
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn user_id(&self) -> UserId {
        self.inner.lock().user_id.clone()
    }

    /// Applies a signed delta at most once per key.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientBalance`] if a debit would drive the
    /// balance below zero. The key is not consumed on failure, so the caller
    /// may retry after a top-up.
    pub fn apply(&self, key: IdempotencyKey, delta: i64) -> Result<DeltaOutcome, LedgerError> {
        let mut data = self.inner.lock();
        if let Some(outcome) = data.replay(&key) {
            return Ok(outcome);
        }
        if data.minutes + delta < 0 {
            return Err(LedgerError::InsufficientBalance);
        }
        Ok(data.commit(key, delta))
    }

    /// Applies a signed delta at most once per key, clamping debits at zero.
    ///
    /// Used by paths that must not fail on a shortfall: session close and
    /// refund clawback. `applied_minutes` in the outcome reports how much
    /// was actually debited.
    pub fn apply_saturating(&self, key: IdempotencyKey, delta: i64) -> DeltaOutcome {
        let mut data = self.inner.lock();
        if let Some(outcome) = data.replay(&key) {
            return outcome;
        }
        let moved = if delta < 0 { -data.minutes.min(-delta) } else { delta };
        data.commit(key, moved)
    }
}

impl Serialize for Balance {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Balance", 3)?;
        state.serialize_field("user", &data.user_id)?;
        state.serialize_field("minutes", &data.minutes)?;
        state.serialize_field("version", &data.version)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> IdempotencyKey {
        IdempotencyKey::new(format!("k-{n}"))
    }

    // === BalanceData Internal Tests ===
    // These exercise the private commit/replay machinery directly.

    #[test]
    fn commit_bumps_version_per_applied_delta() {
        let mut data = BalanceData::new(UserId::new("u-1"));
        data.commit(key(1), 60);
        data.commit(key(2), -10);
        assert_eq!(data.minutes, 50);
        assert_eq!(data.version, 2);
    }

    #[test]
    fn replay_returns_recorded_outcome() {
        let mut data = BalanceData::new(UserId::new("u-1"));
        data.commit(key(1), 60);
        data.commit(key(2), -10);

        let replay = data.replay(&key(1)).unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.new_balance, 60);
        assert_eq!(replay.applied_minutes, 60);
    }

    // === Public API Tests ===

    #[test]
    fn credit_then_debit() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 60).unwrap();
        let outcome = balance.apply(key(2), -25).unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.new_balance, 35);
        assert_eq!(balance.minutes(), 35);
    }

    #[test]
    fn overdraw_returns_insufficient_balance() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 20).unwrap();
        let result = balance.apply(key(2), -30);
        assert_eq!(result, Err(LedgerError::InsufficientBalance));
        assert_eq!(balance.minutes(), 20);
    }

    #[test]
    fn failed_delta_does_not_consume_key() {
        let balance = Balance::new(UserId::new("u-1"));
        assert_eq!(
            balance.apply(key(1), -5),
            Err(LedgerError::InsufficientBalance)
        );

        // Same key succeeds once funds exist.
        balance.apply(key(2), 10).unwrap();
        let outcome = balance.apply(key(1), -5).unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.new_balance, 5);
    }

    #[test]
    fn duplicate_key_applies_once() {
        let balance = Balance::new(UserId::new("u-1"));
        let first = balance.apply(key(1), 60).unwrap();
        let second = balance.apply(key(1), 60).unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert_eq!(second.new_balance, 60);
        assert_eq!(balance.minutes(), 60);
    }

    #[test]
    fn duplicate_key_ignores_new_delta_value() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 60).unwrap();
        // Retry with a different delta still replays the original.
        let replay = balance.apply(key(1), 999).unwrap();
        assert!(!replay.applied);
        assert_eq!(balance.minutes(), 60);
    }

    #[test]
    fn saturating_debit_clamps_at_zero() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 8).unwrap();

        let outcome = balance.apply_saturating(key(2), -12);
        assert!(outcome.applied);
        assert_eq!(outcome.new_balance, 0);
        assert_eq!(outcome.applied_minutes, 8);
    }

    #[test]
    fn saturating_debit_within_balance_is_exact() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 20).unwrap();

        let outcome = balance.apply_saturating(key(2), -12);
        assert_eq!(outcome.new_balance, 8);
        assert_eq!(outcome.applied_minutes, 12);
    }

    #[test]
    fn saturating_replay_is_stable() {
        let balance = Balance::new(UserId::new("u-1"));
        balance.apply(key(1), 8).unwrap();

        let first = balance.apply_saturating(key(2), -12);
        // Top up, then replay the same key: outcome must not change.
        balance.apply(key(3), 100).unwrap();
        let replay = balance.apply_saturating(key(2), -12);

        assert!(!replay.applied);
        assert_eq!(replay.new_balance, first.new_balance);
        assert_eq!(replay.applied_minutes, first.applied_minutes);
        assert_eq!(balance.minutes(), 100);
    }

    // === Serialization Tests ===

    #[test]
    fn serializes_user_minutes_version() {
        let balance = Balance::new(UserId::new("u-42"));
        balance.apply(key(1), 90).unwrap();

        let json = serde_json::to_string(&balance).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["user"], "u-42");
        assert_eq!(parsed["minutes"], 90);
        assert_eq!(parsed["version"], 1);
    }
}
