//! # Decimal Policy
//!
//! The precision policy every monetary value in Meridian flows through.
//!
//! ## Why Decimal Strings?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  In binary floating point:                                              │
//! │    0.1 + 0.2 = 0.30000000000000004  ❌ WRONG!                           │
//! │                                                                         │
//! │  A pricing engine that re-runs the same proposal must produce the      │
//! │  same bytes every time. Floats cannot promise that across              │
//! │  serialization boundaries.                                              │
//! │                                                                         │
//! │  OUR SOLUTION: arbitrary-precision decimal, two fixed scales           │
//! │                                                                         │
//! │    Q7 (7 fractional digits)  → every intermediate value                │
//! │    Q2 (2 fractional digits)  → customer-facing outputs                 │
//! │                                                                         │
//! │    Rounding: HALF AWAY FROM ZERO, everywhere, no exceptions            │
//! │      2.5 → 3,  -2.5 → -3,  23.625 → 23.63                              │
//! │                                                                         │
//! │  Values enter as decimal strings and leave as decimal strings.         │
//! │  An f64 never touches a monetary value.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use meridian_core::decimal::{parse_decimal, round_q7, format_q2};
//!
//! let price = parse_decimal("19.99").unwrap();
//! let line = round_q7(price * rust_decimal::Decimal::from(3));
//! assert_eq!(format_q2(line), "59.97");
//! ```

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Scales
// =============================================================================

/// Fractional digits carried by every intermediate value.
pub const Q7: u32 = 7;

/// Fractional digits of customer-facing outputs.
pub const Q2: u32 = 2;

// =============================================================================
// Rounding
// =============================================================================

/// Rounds to Q7 using half-away-from-zero.
#[inline]
pub fn round_q7(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(Q7, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounds to Q2 using half-away-from-zero.
///
/// ## Example
/// ```rust
/// use meridian_core::decimal::{parse_decimal, round_q2, format_q2};
///
/// let v = parse_decimal("23.625").unwrap();
/// assert_eq!(format_q2(round_q2(v)), "23.63");
/// ```
#[inline]
pub fn round_q2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(Q2, RoundingStrategy::MidpointAwayFromZero)
}

// =============================================================================
// Rendering
// =============================================================================

/// Renders a value as a decimal string with exactly seven fractional digits.
pub fn format_q7(value: Decimal) -> String {
    let mut v = round_q7(value);
    v.rescale(Q7);
    v.to_string()
}

/// Renders a value as a decimal string with exactly two fractional digits.
pub fn format_q2(value: Decimal) -> String {
    let mut v = round_q2(value);
    v.rescale(Q2);
    v.to_string()
}

// =============================================================================
// Parsing
// =============================================================================

/// Parses a decimal string.
///
/// ## Accepted Forms
/// - Plain decimal: `"100"`, `"-52.50"`, `"0.0875"`
/// - Exponential: `"1.5e2"` (expanded to `150`)
///
/// ## Normalisation
/// - Negative zero collapses to zero
/// - Anything else (empty, `NaN`, `inf`, garbage) is rejected
///
/// ## Errors
/// Returns `INVALID_INPUT` naming the offending text. Callers prepend the
/// field path before surfacing it.
pub fn parse_decimal(text: &str) -> CoreResult<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid("value", "empty decimal string"));
    }

    let parsed = trimmed
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| {
            CoreError::invalid("value", format!("'{trimmed}' is not a valid decimal"))
        })?;

    // -0 and 0 must be the same value downstream; a sign bit on zero
    // would leak into canonical encodings and change checksums.
    if parsed.is_zero() {
        return Ok(Decimal::ZERO);
    }

    Ok(parsed)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_q2_half_away_from_zero() {
        assert_eq!(round_q2(dec!(23.625)), dec!(23.63));
        assert_eq!(round_q2(dec!(-23.625)), dec!(-23.63));
        assert_eq!(round_q2(dec!(2.5)), dec!(2.5));
        assert_eq!(round_q2(dec!(0.005)), dec!(0.01));
        assert_eq!(round_q2(dec!(-0.005)), dec!(-0.01));
    }

    #[test]
    fn test_round_q7() {
        assert_eq!(round_q7(dec!(1.00000005)), dec!(1.0000001));
        assert_eq!(round_q7(dec!(-1.00000005)), dec!(-1.0000001));
        assert_eq!(round_q7(dec!(1.00000004)), dec!(1.0000000));
    }

    #[test]
    fn test_format_scales() {
        assert_eq!(format_q7(dec!(200)), "200.0000000");
        assert_eq!(format_q2(dec!(200)), "200.00");
        assert_eq!(format_q2(dec!(-52.5)), "-52.50");
        assert_eq!(format_q7(dec!(120)), "120.0000000");
    }

    #[test]
    fn test_parse_plain() {
        assert_eq!(parse_decimal("100.00").unwrap(), dec!(100));
        assert_eq!(parse_decimal(" -15 ").unwrap(), dec!(-15));
        assert_eq!(parse_decimal("0.0875").unwrap(), dec!(0.0875));
    }

    #[test]
    fn test_parse_exponential_expands() {
        assert_eq!(parse_decimal("1.5e2").unwrap(), dec!(150));
        assert_eq!(parse_decimal("2E-3").unwrap(), dec!(0.002));
    }

    #[test]
    fn test_parse_negative_zero_collapses() {
        let zero = parse_decimal("-0.00").unwrap();
        assert!(zero.is_zero());
        assert!(!zero.is_sign_negative());
        assert_eq!(format_q7(zero), "0.0000000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_decimal("").is_err());
        assert!(parse_decimal("NaN").is_err());
        assert!(parse_decimal("ten dollars").is_err());
        assert!(parse_decimal("1.2.3").is_err());
    }
}
