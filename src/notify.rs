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

//! Best-effort notification stream.
//!
//! The engine publishes events here after a ledger mutation commits; a
//! dispatcher owned by the embedding application drains them. Publishing is
//! lock-free and infallible, and nothing in the ledger depends on the events
//! being consumed.

use crate::base::{SessionId, UserId};
use crossbeam::queue::SegQueue;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fire-and-forget event for the notification dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    LowBalance {
        user_id: UserId,
        minutes: i64,
    },
    SessionEnded {
        user_id: UserId,
        session_id: SessionId,
        duration_minutes: i64,
        cost: Decimal,
        shortfall_minutes: i64,
    },
}

/// Lock-free FIFO of pending notification events.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    events: SegQueue<NotificationEvent>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: NotificationEvent) {
        self.events.push(event);
    }

    pub fn pop(&self) -> Option<NotificationEvent> {
        self.events.pop()
    }

    /// Drains everything currently queued, in publish order.
    pub fn drain(&self) -> Vec<NotificationEvent> {
        let mut drained = Vec::with_capacity(self.events.len());
        while let Some(event) = self.events.pop() {
            drained.push(event);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
