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

//! Parking session entity.
//!
//! Sessions follow a state machine:
//! - [`Active`] → [`Completed`] (via end)
//! - [`Active`] → [`Cancelled`] (via cancel, before any billing)
//!
//! Terminal sessions are immutable; transition legality is enforced here,
//! not at call sites.
//!
//! [`Active`]: SessionStatus::Active
//! [`Completed`]: SessionStatus::Completed
//! [`Cancelled`]: SessionStatus::Cancelled

use crate::base::{LocationId, SessionId, UserId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

/// Who requested the close.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndedBy {
    User,
    Guard,
    System,
}

/// One parking stay.
///
/// `cost` and `duration_minutes` are derived at close time and never
/// mutated independently. `shortfall_minutes` records how much of the
/// duration could not be covered by the balance; the close itself never
/// fails on a shortfall.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParkingSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub location: LocationId,
    pub spot: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub cost: Option<Decimal>,
    pub shortfall_minutes: i64,
    pub ended_by: Option<EndedBy>,
    /// Token encoded into the QR shown to guards; bound to this session.
    pub qr_token: String,
}

impl ParkingSession {
    /// Opens a new active session with a fresh QR token.
    pub fn open(
        user_id: UserId,
        location: LocationId,
        spot: Option<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let session_id = SessionId::generate();
        Self {
            session_id,
            user_id,
            location,
            spot,
            status: SessionStatus::Active,
            started_at,
            ended_at: None,
            duration_minutes: None,
            cost: None,
            shortfall_minutes: 0,
            ended_by: None,
            qr_token: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Metered minutes between start and `now`, rounded up to whole minutes.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        let seconds = (now - self.started_at).num_seconds().max(0);
        (seconds as u64).div_ceil(60) as i64
    }

    /// Returns the completed copy of this session.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if the session is already terminal.
    pub fn completed(
        &self,
        ended_at: DateTime<Utc>,
        duration_minutes: i64,
        cost: Decimal,
        shortfall_minutes: i64,
        ended_by: EndedBy,
    ) -> Result<Self, LedgerError> {
        if !self.is_active() {
            return Err(LedgerError::InvalidTransition);
        }
        let mut session = self.clone();
        session.status = SessionStatus::Completed;
        session.ended_at = Some(ended_at);
        session.duration_minutes = Some(duration_minutes);
        session.cost = Some(cost);
        session.shortfall_minutes = shortfall_minutes;
        session.ended_by = Some(ended_by);
        Ok(session)
    }

    /// Returns the cancelled copy of this session. No balance effect.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidTransition`] if the session is already terminal.
    pub fn cancelled(&self, ended_at: DateTime<Utc>) -> Result<Self, LedgerError> {
        if !self.is_active() {
            return Err(LedgerError::InvalidTransition);
        }
        let mut session = self.clone();
        session.status = SessionStatus::Cancelled;
        session.ended_at = Some(ended_at);
        session.ended_by = None;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn open_session() -> ParkingSession {
        ParkingSession::open(
            UserId::new("u-1"),
            LocationId::new("downtown"),
            Some("B-12".into()),
            start(),
        )
    }

    #[test]
    fn elapsed_rounds_up_to_whole_minutes() {
        let session = open_session();
        assert_eq!(session.elapsed_minutes(start()), 0);
        assert_eq!(session.elapsed_minutes(start() + Duration::seconds(1)), 1);
        assert_eq!(session.elapsed_minutes(start() + Duration::seconds(60)), 1);
        assert_eq!(session.elapsed_minutes(start() + Duration::seconds(61)), 2);
        assert_eq!(session.elapsed_minutes(start() + Duration::minutes(12)), 12);
    }

    #[test]
    fn elapsed_never_negative_on_clock_skew() {
        let session = open_session();
        assert_eq!(session.elapsed_minutes(start() - Duration::minutes(5)), 0);
    }

    #[test]
    fn complete_sets_derived_fields() {
        let session = open_session();
        let ended = session
            .completed(
                start() + Duration::minutes(12),
                12,
                dec!(12.00),
                0,
                EndedBy::Guard,
            )
            .unwrap();

        assert_eq!(ended.status, SessionStatus::Completed);
        assert_eq!(ended.duration_minutes, Some(12));
        assert_eq!(ended.cost, Some(dec!(12.00)));
        assert_eq!(ended.ended_by, Some(EndedBy::Guard));
        assert!(ended.ended_at.is_some());
    }

    #[test]
    fn complete_twice_is_invalid_transition() {
        let session = open_session();
        let ended = session
            .completed(start(), 1, dec!(1.00), 0, EndedBy::User)
            .unwrap();
        let again = ended.completed(start(), 1, dec!(1.00), 0, EndedBy::User);
        assert_eq!(again, Err(LedgerError::InvalidTransition));
    }

    #[test]
    fn cancel_after_complete_is_invalid_transition() {
        let session = open_session();
        let ended = session
            .completed(start(), 1, dec!(1.00), 0, EndedBy::User)
            .unwrap();
        assert_eq!(ended.cancelled(start()), Err(LedgerError::InvalidTransition));
    }

    #[test]
    fn fresh_sessions_get_distinct_qr_tokens() {
        let a = open_session();
        let b = open_session();
        assert_ne!(a.qr_token, b.qr_token);
        assert_ne!(a.session_id, b.session_id);
    }
}
