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

//! Minute-package catalog boundary.
//!
//! The catalog is an external collaborator; the engine only resolves
//! `package id -> (minutes, price)` through the [`Catalog`] trait.
//! [`StaticCatalog`] is the in-memory implementation used by the bin, the
//! demo server, and tests.

use crate::base::PackageId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A purchasable block of parking minutes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Package {
    pub minutes: i64,
    pub price: Decimal,
}

pub trait Catalog: Send + Sync {
    fn package(&self, id: &PackageId) -> Option<Package>;
}

/// Fixed in-memory package catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    packages: HashMap<PackageId, Package>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock three-tier catalog.
    pub fn standard() -> Self {
        Self::new()
            .with_package("pkg-30", 30, dec!(30.00))
            .with_package("pkg-60", 60, dec!(60.00))
            .with_package("pkg-120", 120, dec!(110.00))
    }

    pub fn with_package(
        mut self,
        id: impl Into<String>,
        minutes: i64,
        price: Decimal,
    ) -> Self {
        self.packages
            .insert(PackageId::new(id), Package { minutes, price });
        self
    }
}

impl Catalog for StaticCatalog {
    fn package(&self, id: &PackageId) -> Option<Package> {
        self.packages.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_resolves_packages() {
        let catalog = StaticCatalog::standard();
        let package = catalog.package(&PackageId::new("pkg-60")).unwrap();
        assert_eq!(package.minutes, 60);
        assert_eq!(package.price, dec!(60.00));
    }

    #[test]
    fn unknown_package_is_none() {
        let catalog = StaticCatalog::standard();
        assert!(catalog.package(&PackageId::new("pkg-999")).is_none());
    }
}
