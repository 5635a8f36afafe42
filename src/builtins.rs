// Copyright 2021 The Model Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Built-in function dispatch for the equation evaluator. Each function
//! states its own unit rule; none of
//! them touch the delay-state store, so `call_builtin` takes only the
//! already-evaluated argument quantities and the current simulation time
//! (needed by the piecewise helpers).

use crate::common::{Diagnostic, ErrorCode, Phase, Result};
use crate::units::{format_unit_map, Quantity};

fn arity_error(name: &str, want: &str, got: usize) -> Diagnostic {
    Diagnostic::new(
        Phase::Evaluate,
        ErrorCode::UnsupportedFunction,
        format!("`{name}` expects {want} argument(s), got {got}"),
    )
}

fn unit_mismatch(name: &str, a: &Quantity, b: &Quantity) -> Diagnostic {
    Diagnostic::new(
        Phase::Evaluate,
        ErrorCode::UnitMismatch,
        format!(
            "`{name}` requires matching units, got `{}` and `{}`",
            format_unit_map(&a.units),
            format_unit_map(&b.units)
        ),
    )
}

fn require_dimensionless(name: &str, q: &Quantity) -> Result<()> {
    if !q.is_dimensionless() {
        return Err(Diagnostic::new(
            Phase::Evaluate,
            ErrorCode::DimensionlessRequired,
            format!("`{name}` requires a dimensionless argument, got `{}`", format_unit_map(&q.units)),
        ));
    }
    Ok(())
}

fn unary_transcendental(name: &str, args: &[Quantity], f: impl Fn(f64) -> f64) -> Result<Quantity> {
    match args {
        [a] => {
            require_dimensionless(name, a)?;
            Ok(Quantity::dimensionless(f(a.value)))
        }
        _ => Err(arity_error(name, "1", args.len())),
    }
}

/// Dispatches one of the equation language's built-in functions. `time` is
/// the current simulation time, used only by `STEP`/`PULSE`.
pub fn call_builtin(name: &str, args: &[Quantity], time: f64) -> Result<Quantity> {
    match name.to_ascii_uppercase().as_str() {
        "MIN" => match args {
            [a, b] => {
                if !units_compatible(a, b) {
                    return Err(unit_mismatch("min", a, b));
                }
                Ok(Quantity { value: a.value.min(b.value), units: a.units.clone() })
            }
            _ => Err(arity_error("min", "2", args.len())),
        },
        "MAX" => match args {
            [a, b] => {
                if !units_compatible(a, b) {
                    return Err(unit_mismatch("max", a, b));
                }
                Ok(Quantity { value: a.value.max(b.value), units: a.units.clone() })
            }
            _ => Err(arity_error("max", "2", args.len())),
        },
        "ABS" => match args {
            [a] => Ok(Quantity { value: a.value.abs(), units: a.units.clone() }),
            _ => Err(arity_error("abs", "1", args.len())),
        },
        "FLOOR" => match args {
            [a] => Ok(Quantity { value: a.value.floor(), units: a.units.clone() }),
            _ => Err(arity_error("floor", "1", args.len())),
        },
        "CEIL" => match args {
            [a] => Ok(Quantity { value: a.value.ceil(), units: a.units.clone() }),
            _ => Err(arity_error("ceil", "1", args.len())),
        },
        "ROUND" => match args {
            [a] => Ok(Quantity { value: a.value.round(), units: a.units.clone() }),
            _ => Err(arity_error("round", "1", args.len())),
        },
        "SQRT" => match args {
            [a] => {
                let mut units = a.units.clone();
                for exp in units.values_mut() {
                    *exp /= 2.0;
                }
                units.retain(|_, e: &mut f64| e.abs() > 1e-12);
                Ok(Quantity { value: a.value.sqrt(), units })
            }
            _ => Err(arity_error("sqrt", "1", args.len())),
        },
        "EXP" => unary_transcendental("exp", args, f64::exp),
        "LOG" | "LN" => unary_transcendental("ln", args, f64::ln),
        "LOG10" => unary_transcendental("log10", args, f64::log10),
        "SIN" => unary_transcendental("sin", args, f64::sin),
        "COS" => unary_transcendental("cos", args, f64::cos),
        "TAN" => unary_transcendental("tan", args, f64::tan),
        "ASIN" => unary_transcendental("asin", args, f64::asin),
        "ACOS" => unary_transcendental("acos", args, f64::acos),
        "ATAN" => unary_transcendental("atan", args, f64::atan),
        "ATAN2" => match args {
            [y, x] => {
                if !units_compatible(y, x) {
                    return Err(unit_mismatch("atan2", y, x));
                }
                Ok(Quantity::dimensionless(y.value.atan2(x.value)))
            }
            _ => Err(arity_error("atan2", "2", args.len())),
        },
        "STEP" => match args {
            [height, start] => {
                require_dimensionless("step", start)?;
                let value = if time >= start.value { height.value } else { 0.0 };
                Ok(Quantity { value, units: height.units.clone() })
            }
            _ => Err(arity_error("step", "2 (height, start)", args.len())),
        },
        "PULSE" => match args {
            [height, start, width] => {
                require_dimensionless("pulse", start)?;
                require_dimensionless("pulse", width)?;
                let active = time >= start.value && time < start.value + width.value;
                let value = if active { height.value } else { 0.0 };
                Ok(Quantity { value, units: height.units.clone() })
            }
            _ => Err(arity_error("pulse", "3 (height, start, width)", args.len())),
        },
        other => Err(Diagnostic::new(
            Phase::Evaluate,
            ErrorCode::UnsupportedFunction,
            format!("unknown built-in function `{other}`"),
        )),
    }
}

fn units_compatible(a: &Quantity, b: &Quantity) -> bool {
    // `add` already fails exactly when the two unit maps differ, so reuse
    // its check rather than duplicating unit-map comparison here.
    a.add(b).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max() {
        let a = Quantity::dimensionless(3.0);
        let b = Quantity::dimensionless(7.0);
        assert_eq!(call_builtin("MIN", &[a.clone(), b.clone()], 0.0).unwrap().value, 3.0);
        assert_eq!(call_builtin("MAX", &[a, b], 0.0).unwrap().value, 7.0);
    }

    #[test]
    fn test_sqrt_halves_exponents() {
        let mut units = crate::units::UnitExponentMap::new();
        units.insert("meters".to_string(), 2.0);
        let area = Quantity { value: 16.0, units };
        let side = call_builtin("SQRT", &[area], 0.0).unwrap();
        assert_eq!(side.value, 4.0);
        assert_eq!(side.units.get("meters"), Some(&1.0));
    }

    #[test]
    fn test_trig_requires_dimensionless() {
        let mut units = crate::units::UnitExponentMap::new();
        units.insert("tick".to_string(), 1.0);
        let q = Quantity { value: 1.0, units };
        let err = call_builtin("SIN", &[q], 0.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::DimensionlessRequired);
    }

    #[test]
    fn test_step_function() {
        let height = Quantity::dimensionless(5.0);
        let start = Quantity::dimensionless(2.0);
        assert_eq!(call_builtin("STEP", &[height.clone(), start.clone()], 1.0).unwrap().value, 0.0);
        assert_eq!(call_builtin("STEP", &[height, start], 3.0).unwrap().value, 5.0);
    }

    #[test]
    fn test_pulse_function() {
        let height = Quantity::dimensionless(5.0);
        let start = Quantity::dimensionless(2.0);
        let width = Quantity::dimensionless(1.0);
        assert_eq!(call_builtin("PULSE", &[height.clone(), start.clone(), width.clone()], 1.0).unwrap().value, 0.0);
        assert_eq!(call_builtin("PULSE", &[height.clone(), start.clone(), width.clone()], 2.5).unwrap().value, 5.0);
        assert_eq!(call_builtin("PULSE", &[height, start, width], 3.5).unwrap().value, 0.0);
    }

    #[test]
    fn test_unknown_function() {
        let err = call_builtin("NOPE", &[], 0.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFunction);
    }
}
