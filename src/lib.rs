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

//! # Parking Ledger
//!
//! This library provides a prepaid parking ledger engine: users buy minute
//! packages, consume the balance while parked, and external confirmations
//! (payment webhooks, guard scans) are reconciled against in-flight state
//! at most once.
//!
//! ## Core Components
//!
//! - [`Engine`]: purchases, session metering, reconciliation, and the user
//!   view
//! - [`LedgerStore`]: keyed, versioned storage with idempotent balance
//!   deltas and compare-and-swap record updates
//! - [`Balance`]: per-user minute balance with at-most-once delta
//!   application
//! - [`ParkingSession`] / [`PaymentTransaction`]: entity state machines
//! - [`LedgerError`]: error taxonomy for ledger operations
//!
//! ## Example
//!
//! ```
//! use parking_ledger_rs::{
//!     Engine, LocationId, PackageId, PaymentMethod, UserId,
//! };
//!
//! let engine = Engine::default();
//! let user = UserId::new("u-1");
//!
//! // Buy 60 minutes by card (authorizes and credits synchronously).
//! engine
//!     .initiate_purchase(
//!         user.clone(),
//!         &PackageId::new("pkg-60"),
//!         PaymentMethod::Card,
//!         Some("tok-visa".into()),
//!     )
//!     .unwrap();
//!
//! // Park.
//! let session = engine
//!     .start_session(user.clone(), LocationId::new("downtown"), None)
//!     .unwrap();
//! assert_eq!(engine.user_view(&user).minutes, 60);
//! assert!(engine.get_active_session(&user).is_some());
//! # let _ = session;
//! ```
//!
//! ## Thread Safety
//!
//! The engine handles concurrent access per user, allowing operations for
//! different users to proceed in parallel while mutations for one user are
//! totally ordered.

pub mod balance;
mod base;
pub mod catalog;
pub mod clock;
mod engine;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod policy;
mod session;
mod store;
mod transaction;

pub use balance::{Balance, DeltaOutcome};
pub use base::{
    ExternalEventId, IdempotencyKey, LocationId, PackageId, SessionId, TransactionId, UserId,
};
pub use catalog::{Catalog, Package, StaticCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, Outcome, ReconcilePayload, UserMinutes, UserView};
pub use error::LedgerError;
pub use gateway::{CardAuthorization, PaymentGateway, StaticGateway};
pub use notify::{NotificationEvent, NotificationQueue};
pub use policy::Policy;
pub use session::{EndedBy, ParkingSession, SessionStatus};
pub use store::{LedgerStore, ProcessedEvent, ReconcileEffect};
pub use transaction::{PaymentMethod, PaymentTransaction, TransactionKind, TransactionStatus};
