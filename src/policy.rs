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

//! Policy configuration: balance thresholds and per-minute rates.
//!
//! The thresholds are display/admission policy, not ledger invariants, so
//! they live in a plain config struct rather than in the entities.

use crate::base::LocationId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tunable policy for the engine.
///
/// Deserializable so an embedding application can load it from a config
/// file; [`Policy::default`] carries the stock constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Minimum balance required to open a session.
    pub min_start_minutes: i64,
    /// Balance below this flags the user view as low.
    pub low_balance_minutes: i64,
    /// Balance below this flags the user view as critical.
    pub critical_balance_minutes: i64,
    /// ISO currency code passed to the payment gateway.
    pub currency: String,
    /// Currency charged per metered minute when the location has no
    /// override.
    pub default_rate_per_minute: Decimal,
    /// Per-location rate overrides.
    pub location_rates: HashMap<LocationId, Decimal>,
}

impl Policy {
    /// Rate charged per minute at the given location.
    pub fn rate_per_minute(&self, location: &LocationId) -> Decimal {
        self.location_rates
            .get(location)
            .copied()
            .unwrap_or(self.default_rate_per_minute)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_start_minutes: 10,
            low_balance_minutes: 30,
            critical_balance_minutes: 15,
            currency: "USD".to_string(),
            default_rate_per_minute: dec!(1.00),
            location_rates: HashMap::new(),
        }
    }
}
