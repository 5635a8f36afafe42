// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Named units with dimensional vectors and conversion factors, and the
//! unit-safe arithmetic built on top of them (`spec.md` §4.1).

use std::collections::BTreeMap;
use std::fmt;

use float_cmp::approx_eq;

use crate::common::{Diagnostic, ErrorCode, Phase, Result};

/// A mapping from base-dimension name (`time`, `mass`, `population`, ...)
/// to a signed integer exponent. Missing keys are implicit zero.
pub type Dimension = BTreeMap<String, i32>;

/// A mapping from registered unit symbol to a real exponent. Integers are
/// required where a unit map is raised to a power outside of a `{...}`
/// literal; any real is allowed inside a literal.
pub type UnitExponentMap = BTreeMap<String, f64>;

fn dimensions_equal(a: &Dimension, b: &Dimension) -> bool {
    let nonzero = |d: &Dimension| -> BTreeMap<&str, i32> {
        d.iter()
            .filter(|(_, &e)| e != 0)
            .map(|(k, &e)| (k.as_str(), e))
            .collect()
    };
    nonzero(a) == nonzero(b)
}

pub fn unit_maps_equal(a: &UnitExponentMap, b: &UnitExponentMap) -> bool {
    let nonzero = |m: &UnitExponentMap| -> BTreeMap<&str, f64> {
        m.iter()
            .filter(|(_, &e)| e.abs() > 1e-12)
            .map(|(k, &e)| (k.as_str(), e))
            .collect()
    };
    let (na, nb) = (nonzero(a), nonzero(b));
    na.len() == nb.len()
        && na
            .iter()
            .all(|(k, v)| nb.get(k).is_some_and(|w| approx_eq!(f64, *v, *w, epsilon = 1e-9)))
}

/// Render a unit map the way diagnostics quote it, e.g. `people · tick^-1`.
pub fn format_unit_map(units: &UnitExponentMap) -> String {
    let terms: Vec<String> = units
        .iter()
        .filter(|(_, &e)| e.abs() > 1e-12)
        .map(|(sym, &exp)| {
            if approx_eq!(f64, exp, 1.0, epsilon = 1e-9) {
                sym.clone()
            } else if approx_eq!(f64, exp, exp.round(), epsilon = 1e-9) {
                format!("{sym}^{}", exp.round() as i64)
            } else {
                format!("{sym}^{exp}")
            }
        })
        .collect();
    if terms.is_empty() {
        "1".to_string()
    } else {
        terms.join(" · ")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnitDefinition {
    pub symbol: String,
    pub dimension: Dimension,
    /// multiplicative conversion to the base unit of its dimension
    pub factor: f64,
}

/// An ordered, immutable table of unit definitions. `register` returns a
/// *new* registry rather than mutating in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnitRegistry {
    defs: Vec<UnitDefinition>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        UnitRegistry::default()
    }

    pub fn register(&self, defs: impl IntoIterator<Item = UnitDefinition>) -> Result<Self> {
        let mut next = self.clone();
        for def in defs {
            if next.find(&def.symbol).is_some() {
                return Err(Diagnostic::new(
                    Phase::Unit,
                    ErrorCode::UnsupportedQuantity,
                    format!("duplicate unit symbol `{}`", def.symbol),
                ));
            }
            next.defs.push(def);
        }
        Ok(next)
    }

    pub fn find(&self, symbol: &str) -> Option<&UnitDefinition> {
        self.defs.iter().find(|d| d.symbol == symbol)
    }

    pub fn definitions(&self) -> &[UnitDefinition] {
        &self.defs
    }

    fn not_found(symbol: &str) -> Diagnostic {
        Diagnostic::new(
            Phase::Unit,
            ErrorCode::UnitNotFound,
            format!("unit `{symbol}` is not registered"),
        )
    }

    fn dimension_mismatch(from: &UnitDefinition, to: &UnitDefinition) -> Diagnostic {
        Diagnostic::new(
            Phase::Unit,
            ErrorCode::UnitDimensionMismatch,
            format!(
                "cannot convert between `{}` and `{}`: incompatible dimensions",
                from.symbol, to.symbol
            ),
        )
    }

    /// `x * from.factor / to.factor`, after checking `from`/`to` exist and
    /// share a dimension.
    pub fn convert_value(&self, x: f64, from: &str, to: &str) -> Result<f64> {
        let from_def = self.find(from).ok_or_else(|| Self::not_found(from))?;
        let to_def = self.find(to).ok_or_else(|| Self::not_found(to))?;
        if !dimensions_equal(&from_def.dimension, &to_def.dimension) {
            return Err(Self::dimension_mismatch(from_def, to_def));
        }
        Ok(x * from_def.factor / to_def.factor)
    }

    /// Convert a [`Quantity`] whose unit map is a single symbol with
    /// exponent 1 to the unit `to`.
    pub fn convert_quantity(&self, q: &Quantity, to: &str) -> Result<Quantity> {
        if q.units.len() != 1 {
            return Err(Diagnostic::new(
                Phase::Unit,
                ErrorCode::UnsupportedQuantity,
                "convertQuantity only supports a quantity with a single unit symbol",
            ));
        }
        let (from, &exp) = q.units.iter().next().unwrap();
        if !approx_eq!(f64, exp, 1.0, epsilon = 1e-9) {
            return Err(Diagnostic::new(
                Phase::Unit,
                ErrorCode::UnsupportedQuantity,
                "convertQuantity only supports a unit with exponent 1",
            ));
        }
        let value = self.convert_value(q.value, from, to)?;
        let mut units = UnitExponentMap::new();
        units.insert(to.to_string(), 1.0);
        Ok(Quantity { value, units })
    }
}

impl fmt::Display for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, def) in self.defs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", def.symbol)?;
        }
        Ok(())
    }
}

/// A finite real value paired with a unit map. A dimensionless quantity
/// has an empty map.
#[derive(Clone, Debug, PartialEq)]
pub struct Quantity {
    pub value: f64,
    pub units: UnitExponentMap,
}

impl Quantity {
    pub fn dimensionless(value: f64) -> Self {
        Quantity {
            value,
            units: UnitExponentMap::new(),
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.units.values().all(|&e| e.abs() < 1e-12)
    }

    fn mismatch(op: &str, a: &Quantity, b: &Quantity, code: ErrorCode) -> Diagnostic {
        Diagnostic::new(
            Phase::Evaluate,
            code,
            format!(
                "`{op}` requires matching units, got `{}` and `{}`",
                format_unit_map(&a.units),
                format_unit_map(&b.units)
            ),
        )
    }

    pub fn add(&self, other: &Quantity) -> Result<Quantity> {
        if !unit_maps_equal(&self.units, &other.units) {
            return Err(Self::mismatch("+", self, other, ErrorCode::UnitMismatch));
        }
        Ok(Quantity {
            value: self.value + other.value,
            units: self.units.clone(),
        })
    }

    pub fn sub(&self, other: &Quantity) -> Result<Quantity> {
        if !unit_maps_equal(&self.units, &other.units) {
            return Err(Self::mismatch("-", self, other, ErrorCode::UnitMismatch));
        }
        Ok(Quantity {
            value: self.value - other.value,
            units: self.units.clone(),
        })
    }

    pub fn mul(&self, other: &Quantity) -> Quantity {
        let mut units = self.units.clone();
        for (sym, exp) in &other.units {
            let entry = units.entry(sym.clone()).or_insert(0.0);
            *entry += exp;
        }
        units.retain(|_, e| e.abs() > 1e-12);
        Quantity {
            value: self.value * other.value,
            units,
        }
    }

    pub fn div(&self, other: &Quantity) -> Quantity {
        let mut units = self.units.clone();
        for (sym, exp) in &other.units {
            let entry = units.entry(sym.clone()).or_insert(0.0);
            *entry -= exp;
        }
        units.retain(|_, e| e.abs() > 1e-12);
        Quantity {
            value: self.value / other.value,
            units,
        }
    }

    /// `pow(q, n)` — `n` must be an integer when `q` is dimensional.
    pub fn pow(&self, n: f64) -> Result<Quantity> {
        let is_integer = approx_eq!(f64, n, n.round(), epsilon = 1e-9);
        if !self.is_dimensionless() && !is_integer {
            return Err(Diagnostic::new(
                Phase::Evaluate,
                ErrorCode::NonIntegerExponent,
                format!(
                    "raising a dimensional quantity (`{}`) to a non-integer power ({n}) is not allowed",
                    format_unit_map(&self.units)
                ),
            ));
        }
        let mut units = self.units.clone();
        for exp in units.values_mut() {
            *exp *= n;
        }
        units.retain(|_, e| e.abs() > 1e-12);
        Ok(Quantity {
            value: self.value.powf(n),
            units,
        })
    }

    pub fn modulo(&self, other: &Quantity) -> Result<Quantity> {
        if !self.is_dimensionless() || !other.is_dimensionless() {
            return Err(Diagnostic::new(
                Phase::Evaluate,
                ErrorCode::DimensionlessRequired,
                "`mod` requires both operands to be dimensionless",
            ));
        }
        Ok(Quantity::dimensionless(self.value % other.value))
    }

    pub fn compare_eq(&self, other: &Quantity) -> Result<bool> {
        if !unit_maps_equal(&self.units, &other.units) {
            return Err(Self::mismatch("==", self, other, ErrorCode::EqualityUnitMismatch));
        }
        Ok(approx_eq!(f64, self.value, other.value, epsilon = 1e-12))
    }

    pub fn compare_ord(&self, other: &Quantity) -> Result<std::cmp::Ordering> {
        if !unit_maps_equal(&self.units, &other.units) {
            return Err(Self::mismatch("<", self, other, ErrorCode::ComparisonUnitMismatch));
        }
        Ok(self.value.partial_cmp(&other.value).unwrap_or(std::cmp::Ordering::Equal))
    }
}
