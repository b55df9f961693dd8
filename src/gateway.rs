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

//! Payment provider boundary.
//!
//! Card purchases do a synchronous authorization round trip through the
//! [`PaymentGateway`] trait. Webhook signature verification is the
//! gateway's concern; by the time an event reaches the engine it is already
//! a verified `(external event id, payload)` pair.

use crate::error::LedgerError;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Result of a card authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardAuthorization {
    pub approved: bool,
    /// Provider payment-intent id; stored as the transaction's
    /// `external_ref` so later webhooks can be matched to it.
    pub external_ref: String,
}

pub trait PaymentGateway: Send + Sync {
    /// Authorizes a card charge.
    ///
    /// A declined card is an approved=false authorization, not an error;
    /// errors are reserved for the provider being unreachable.
    fn authorize_card(
        &self,
        amount: Decimal,
        currency: &str,
        method_ref: &str,
    ) -> Result<CardAuthorization, LedgerError>;
}

/// Deterministic gateway for demos and tests.
///
/// Approves everything except method refs carrying the `declined:` prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGateway;

impl StaticGateway {
    pub const DECLINE_PREFIX: &'static str = "declined:";

    pub fn new() -> Self {
        Self
    }
}

impl PaymentGateway for StaticGateway {
    fn authorize_card(
        &self,
        _amount: Decimal,
        _currency: &str,
        method_ref: &str,
    ) -> Result<CardAuthorization, LedgerError> {
        Ok(CardAuthorization {
            approved: !method_ref.starts_with(Self::DECLINE_PREFIX),
            external_ref: format!("auth-{}", Uuid::new_v4().simple()),
        })
    }
}
