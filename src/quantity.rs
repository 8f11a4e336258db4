//! Resource quantity arithmetic for status totals.
//!
//! Kubernetes quantities are strings ("500m", "1.5Gi", "2e3"). Status totals
//! need sums of them, so they are parsed into integer milli-units, added,
//! and rendered back in a canonical form.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Power of the multiplier a suffix applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scale {
    /// 1024^n
    Binary(u32),
    /// 10^n
    Decimal(i32),
}

/// Parse a quantity into thousandths of its base unit, rounding up.
///
/// Exact: the digits are read as an integer mantissa and scaled with integer
/// powers, so only a genuine sub-milli remainder rounds up. Returns `None`
/// for strings that are not valid quantities or that overflow.
pub fn parse_milli(quantity: &Quantity) -> Option<i128> {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return None;
    }

    let (number, scale) = split_suffix(raw)?;
    let (mantissa, fraction_digits) = parse_decimal(number)?;
    let fraction_digits = i32::try_from(fraction_digits).ok()?;

    let milli = mantissa.checked_mul(1000)?;
    let (numerator, exponent) = match scale {
        Scale::Binary(power) => (milli.checked_mul(1024i128.checked_pow(power)?)?, -fraction_digits),
        Scale::Decimal(power) => (milli, power.checked_sub(fraction_digits)?),
    };

    if exponent >= 0 {
        numerator.checked_mul(10i128.checked_pow(exponent.unsigned_abs())?)
    } else {
        let divisor = 10i128.checked_pow(exponent.unsigned_abs())?;
        let whole = numerator / divisor;
        Some(if numerator % divisor == 0 { whole } else { whole + 1 })
    }
}

/// Split "12.345" into mantissa 12345 and 3 fraction digits.
fn parse_decimal(number: &str) -> Option<(i128, usize)> {
    let number = number.strip_prefix('+').unwrap_or(number);
    let (integer, fraction) = match number.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (number, ""),
    };
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integer.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut mantissa: i128 = 0;
    for digit in integer.chars().chain(fraction.chars()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(digit.to_digit(10)?))?;
    }
    Some((mantissa, fraction.len()))
}

fn split_suffix(raw: &str) -> Option<(&str, Scale)> {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return Some((number, Scale::Binary(power)));
        }
    }

    // Exponent form: "2e3", "1.5E-2"
    if let Some(pos) = raw.find(['e', 'E']) {
        let (number, exponent) = raw.split_at(pos);
        if let Ok(exp) = exponent[1..].parse::<i32>() {
            return Some((number, Scale::Decimal(exp)));
        }
    }

    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return Some((number, Scale::Decimal(power)));
        }
    }

    Some((raw, Scale::Decimal(0)))
}

/// Render CPU milli-cores: whole cores as "N", otherwise "Nm".
pub fn format_cpu(milli: i128) -> Quantity {
    if milli % 1000 == 0 {
        Quantity((milli / 1000).to_string())
    } else {
        Quantity(format!("{}m", milli))
    }
}

/// Render a byte count with the largest exact binary suffix.
pub fn format_bytes(milli: i128) -> Quantity {
    // Fractional bytes round up to whole bytes.
    let bytes = (milli + 999) / 1000;
    for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
        let unit = 1024i128.pow(*power);
        if bytes != 0 && bytes % unit == 0 {
            return Quantity(format!("{}{}", bytes / unit, suffix));
        }
    }
    Quantity(bytes.to_string())
}

/// Render a count of discrete devices (GPUs, TPUs).
pub fn format_count(milli: i128) -> Quantity {
    Quantity(((milli + 999) / 1000).to_string())
}
