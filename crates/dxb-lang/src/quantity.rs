//! Numeric values with units.
//!
//! A [`Quantity`] is an exact fraction with a sign plus a list of base unit
//! codes and their exponents. Unit strings such as `km/h` or `kg*m^2/s^2` are
//! resolved to base units by a [`UnitSystem`]; prefix and alias factors are
//! folded into the fraction.
use crate::error::ValueError;
use smallvec::SmallVec;
use std::fmt;

pub const UNIT_SECOND: u8 = 0x00;
pub const UNIT_METRE: u8 = 0x01;
pub const UNIT_GRAM: u8 = 0x02;
pub const UNIT_AMPERE: u8 = 0x03;
pub const UNIT_KELVIN: u8 = 0x04;
pub const UNIT_MOLE: u8 = 0x05;
pub const UNIT_CANDELA: u8 = 0x06;
pub const UNIT_EUR: u8 = 0xa0;
pub const UNIT_USD: u8 = 0xa1;
pub const UNIT_GBP: u8 = 0xa2;
pub const UNIT_RUB: u8 = 0xa3;
pub const UNIT_CNY: u8 = 0xa4;
pub const UNIT_JPY: u8 = 0xa5;
pub const UNIT_CALENDAR_MONTH: u8 = 0xc0;
pub const UNIT_UNYT: u8 = 0xd0;
pub const UNIT_DIMENSIONLESS: u8 = 0xff;

const EXPONENT_MIN: i32 = -128;
const EXPONENT_MAX: i32 = 127;

/// Encoded unit: pairs of base unit code and exponent.
pub type EncodedUnit = SmallVec<[(u8, i8); 4]>;

/// One component of an expanded unit symbol: `num/den` factor, base code, exponent.
pub type UnitComponent = (u128, u128, u8, i32);

/// Resolves unit symbols to base units.
pub trait UnitSystem: Send + Sync + fmt::Debug {
    /// Expands `symbol` (without prefix) into base unit components, or `None`
    /// if the symbol is unknown.
    fn expand_symbol(&self, symbol: &str) -> Option<Vec<UnitComponent>>;

    /// Power of ten for a prefix character.
    fn prefix_exponent(&self, prefix: char) -> Option<i32>;
}

/// SI base units, currencies and the usual derived units and aliases.
#[derive(Debug, Default, Clone, Copy)]
pub struct SiUnits;

const KG: UnitComponent = (1000, 1, UNIT_GRAM, 1);
const PER_KG: UnitComponent = (1000, 1, UNIT_GRAM, -1);
const SQUARE_METRE: UnitComponent = (1, 1, UNIT_METRE, 2);
const PER_SQUARE_METRE: UnitComponent = (1, 1, UNIT_METRE, -2);
const PER_SECOND: UnitComponent = (1, 1, UNIT_SECOND, -1);
const PER_SQUARE_SECOND: UnitComponent = (1, 1, UNIT_SECOND, -2);
const PER_CUBE_SECOND: UnitComponent = (1, 1, UNIT_SECOND, -3);

impl UnitSystem for SiUnits {
    fn expand_symbol(&self, symbol: &str) -> Option<Vec<UnitComponent>> {
        let base = |code: u8| Some(vec![(1, 1, code, 1)]);
        match symbol {
            "s" => base(UNIT_SECOND),
            "m" => base(UNIT_METRE),
            "g" => base(UNIT_GRAM),
            "A" => base(UNIT_AMPERE),
            "K" => base(UNIT_KELVIN),
            "mol" => base(UNIT_MOLE),
            "cd" => base(UNIT_CANDELA),
            "EUR" | "€" => base(UNIT_EUR),
            "USD" | "$" => base(UNIT_USD),
            "GBP" | "£" => base(UNIT_GBP),
            "RUB" | "₽" => base(UNIT_RUB),
            "CNY" | "¥" => base(UNIT_CNY),
            "JPY" => base(UNIT_JPY),
            "UNYT" => base(UNIT_UNYT),
            "Cmo" => base(UNIT_CALENDAR_MONTH),
            "x" | "1" | "rad" | "sr" => base(UNIT_DIMENSIONLESS),

            "min" => Some(vec![(60, 1, UNIT_SECOND, 1)]),
            "h" => Some(vec![(3600, 1, UNIT_SECOND, 1)]),
            "d" => Some(vec![(86_400, 1, UNIT_SECOND, 1)]),
            "a" | "yr" => Some(vec![(31_557_600, 1, UNIT_SECOND, 1)]),
            "t" => Some(vec![(1_000_000, 1, UNIT_GRAM, 1)]),
            "u" => Some(vec![(1, 1_660_540_000_000_000_052_570_466_811_904, UNIT_GRAM, 1)]),
            "au" => Some(vec![(149_598_000_000, 1, UNIT_METRE, 1)]),
            "pc" => Some(vec![(30_857_000_000_000_000, 1, UNIT_METRE, 1)]),
            "Cyr" | "Ca" => Some(vec![(12, 1, UNIT_CALENDAR_MONTH, 1)]),

            "N" => Some(vec![KG, (1, 1, UNIT_METRE, 1), PER_SQUARE_SECOND]),
            "Hz" | "Bq" => Some(vec![PER_SECOND]),
            "Pa" => Some(vec![KG, (1, 1, UNIT_METRE, -1), PER_SQUARE_SECOND]),
            "J" => Some(vec![KG, SQUARE_METRE, PER_SQUARE_SECOND]),
            "W" => Some(vec![KG, SQUARE_METRE, PER_CUBE_SECOND]),
            "C" => Some(vec![(1, 1, UNIT_SECOND, 1), (1, 1, UNIT_AMPERE, 1)]),
            "V" => Some(vec![KG, SQUARE_METRE, PER_CUBE_SECOND, (1, 1, UNIT_AMPERE, -1)]),
            "F" => Some(vec![
                PER_KG,
                PER_SQUARE_METRE,
                (1, 1, UNIT_SECOND, 4),
                (1, 1, UNIT_AMPERE, 2),
            ]),
            "O" | "Ω" => Some(vec![KG, SQUARE_METRE, PER_CUBE_SECOND, (1, 1, UNIT_AMPERE, -2)]),
            "S" => Some(vec![
                PER_KG,
                PER_SQUARE_METRE,
                (1, 1, UNIT_SECOND, 3),
                (1, 1, UNIT_AMPERE, 2),
            ]),
            "Wb" => Some(vec![KG, SQUARE_METRE, PER_SQUARE_SECOND, (1, 1, UNIT_AMPERE, -1)]),
            "T" => Some(vec![KG, PER_SQUARE_SECOND, (1, 1, UNIT_AMPERE, -1)]),
            "H" => Some(vec![KG, SQUARE_METRE, PER_SQUARE_SECOND, (1, 1, UNIT_AMPERE, -2)]),
            "lm" => base(UNIT_CANDELA),
            "lx" => Some(vec![(1, 1, UNIT_CANDELA, 1), PER_SQUARE_METRE]),
            "Gy" => Some(vec![SQUARE_METRE, PER_SQUARE_SECOND]),
            "kat" => Some(vec![(1, 1, UNIT_MOLE, 1), PER_SECOND]),
            "l" => Some(vec![(1, 1000, UNIT_METRE, 3)]),
            "eV" => Some(vec![
                (1, 160_217_700_000_000_000, UNIT_DIMENSIONLESS, 1),
                KG,
                SQUARE_METRE,
                PER_SQUARE_SECOND,
            ]),
            _ => None,
        }
    }

    fn prefix_exponent(&self, prefix: char) -> Option<i32> {
        match prefix {
            'Y' => Some(24),
            'Z' => Some(21),
            'E' => Some(18),
            'P' => Some(15),
            'T' => Some(12),
            'G' => Some(9),
            'M' => Some(6),
            'k' => Some(3),
            'h' => Some(2),
            'd' => Some(-1),
            'c' => Some(-2),
            'm' => Some(-3),
            'u' | 'µ' => Some(-6),
            'n' => Some(-9),
            'p' => Some(-12),
            'f' => Some(-15),
            'a' => Some(-18),
            'z' => Some(-21),
            'y' => Some(-24),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Quantity {
    negative: bool,
    numerator: u128,
    denominator: u128,
    unit: EncodedUnit,
}

impl Quantity {
    /// Parses a literal such as `("1.5", "km/h")` or `("1/3", "EUR")`.
    pub fn parse(value: &str, unit: &str, units: &dyn UnitSystem) -> Result<Self, ValueError> {
        let (negative, numerator, denominator) = parse_fraction(value)?;
        let mut quantity = Quantity {
            negative,
            numerator,
            denominator,
            unit: EncodedUnit::new(),
        };

        quantity.reduce();

        let (factor_num, factor_den, encoded) = parse_unit(unit, units)?;
        quantity.unit = encoded;
        quantity.scale(factor_num, factor_den)?;
        Ok(quantity)
    }

    /// Builds a dimensionless quantity from a signed fraction.
    pub fn from_fraction(numerator: i128, denominator: i128) -> Result<Self, ValueError> {
        if denominator == 0 {
            return Err(ValueError::InvalidQuantity(format!("{}/0", numerator)));
        }
        let mut quantity = Quantity {
            negative: (numerator < 0) != (denominator < 0),
            numerator: numerator.unsigned_abs(),
            denominator: denominator.unsigned_abs(),
            unit: EncodedUnit::new(),
        };
        quantity.reduce();
        Ok(quantity)
    }

    pub fn is_negative(&self) -> bool {
        self.negative && self.numerator != 0
    }

    pub fn numerator(&self) -> u128 {
        self.numerator
    }

    pub fn denominator(&self) -> u128 {
        self.denominator
    }

    pub fn unit(&self) -> &[(u8, i8)] {
        &self.unit
    }

    /// Big-endian bytes of the numerator, at least one byte.
    pub fn numerator_bytes(&self) -> Vec<u8> {
        minimal_be_bytes(self.numerator)
    }

    pub fn denominator_bytes(&self) -> Vec<u8> {
        minimal_be_bytes(self.denominator)
    }

    fn scale(&mut self, num: u128, den: u128) -> Result<(), ValueError> {
        if num == 1 && den == 1 {
            return Ok(());
        }
        let g1 = gcd(self.numerator, den);
        let g2 = gcd(num, self.denominator);
        let (n, d) = (
            (self.numerator / g1.max(1)).checked_mul(num / g2.max(1)),
            (self.denominator / g2.max(1)).checked_mul(den / g1.max(1)),
        );
        match (n, d) {
            (Some(n), Some(d)) => {
                self.numerator = n;
                self.denominator = d;
                self.reduce();
                Ok(())
            }
            _ => Err(ValueError::QuantityOutOfRange),
        }
    }

    fn reduce(&mut self) {
        let g = gcd(self.numerator, self.denominator);
        if g > 1 {
            self.numerator /= g;
            self.denominator /= g;
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            write!(f, "-")?;
        }
        write!(f, "{}", self.numerator)?;
        if self.denominator != 1 {
            write!(f, "/{}", self.denominator)?;
        }
        for (code, exp) in &self.unit {
            write!(f, " [{:#04x}^{}]", code, exp)?;
        }
        Ok(())
    }
}

fn minimal_be_bytes(n: u128) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn pow10(exp: u32) -> Result<u128, ValueError> {
    10u128.checked_pow(exp).ok_or(ValueError::QuantityOutOfRange)
}

fn parse_digits(digits: &str, original: &str) -> Result<u128, ValueError> {
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse::<u128>()
        .map_err(|_| ValueError::InvalidQuantity(original.to_string()))
}

/// Parses `1.25`, `-3`, `0.5e12`, `1/10` into sign, numerator and denominator.
fn parse_fraction(value: &str) -> Result<(bool, u128, u128), ValueError> {
    let invalid = || ValueError::InvalidQuantity(value.to_string());
    let cleaned: String = value.chars().filter(|c| *c != '_' && *c != ' ').collect();

    let (negative, rest) = match cleaned.as_bytes().first() {
        Some(b'-') => (true, &cleaned[1..]),
        Some(b'+') => (false, &cleaned[1..]),
        _ => (false, cleaned.as_str()),
    };

    if let Some((n, d)) = rest.split_once('/') {
        let n = parse_digits(n, value)?;
        let d = parse_digits(d, value)?;
        if d == 0 {
            return Err(invalid());
        }
        return Ok((negative, n, d));
    }

    let (mantissa, mut num_factor, mut den_factor) = match rest.split_once(['e', 'E']) {
        Some((m, e)) => {
            let exp: i32 = e.parse().map_err(|_| invalid())?;
            if exp >= 0 {
                (m, pow10(exp as u32)?, 1)
            } else {
                (m, 1, pow10(exp.unsigned_abs())?)
            }
        }
        None => (rest, 1, 1),
    };

    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    let digits = format!("{}{}", int_part, frac_part);
    let numerator = parse_digits(&digits, value)?;
    den_factor = den_factor
        .checked_mul(pow10(frac_part.len() as u32)?)
        .ok_or(ValueError::QuantityOutOfRange)?;
    let g = gcd(num_factor, den_factor);
    if g > 1 {
        num_factor /= g;
        den_factor /= g;
    }
    let numerator = numerator
        .checked_mul(num_factor)
        .ok_or(ValueError::QuantityOutOfRange)?;

    Ok((negative, numerator, den_factor))
}

fn expand_with_prefix(symbol: &str, units: &dyn UnitSystem) -> Result<Vec<UnitComponent>, ValueError> {
    if let Some(expanded) = units.expand_symbol(symbol) {
        return Ok(expanded);
    }

    let invalid = || ValueError::InvalidUnitSymbol(symbol.to_string());
    let mut chars = symbol.chars();
    let prefix = chars.next().ok_or_else(invalid)?;
    let prefix_exp = units.prefix_exponent(prefix).ok_or_else(invalid)?;
    let mut expanded = units.expand_symbol(chars.as_str()).ok_or_else(invalid)?;

    let factor = pow10(prefix_exp.unsigned_abs())?;
    if prefix_exp > 0 {
        expanded.push((factor, 1, UNIT_DIMENSIONLESS, 1));
    } else {
        expanded.push((1, factor, UNIT_DIMENSIONLESS, 1));
    }
    Ok(expanded)
}

fn add_unit_and_exponent(encoded: &mut EncodedUnit, code: u8, exponent: i32) -> Result<(), ValueError> {
    if code == UNIT_DIMENSIONLESS {
        return Ok(());
    }
    match encoded.iter().position(|(c, _)| *c == code) {
        Some(i) => {
            let combined = encoded[i].1 as i32 + exponent;
            if combined == 0 {
                encoded.remove(i);
            } else {
                encoded[i].1 = exponent_to_i8(combined)?;
            }
        }
        None => encoded.push((code, exponent_to_i8(exponent)?)),
    }
    Ok(())
}

fn exponent_to_i8(exp: i32) -> Result<i8, ValueError> {
    if !(EXPONENT_MIN..=EXPONENT_MAX).contains(&exp) {
        return Err(ValueError::UnitExponentOutOfRange(exp));
    }
    Ok(exp as i8)
}

/// Resolves a unit string to a factor and the sorted encoded unit.
fn parse_unit(unit: &str, units: &dyn UnitSystem) -> Result<(u128, u128, EncodedUnit), ValueError> {
    let mut encoded = EncodedUnit::new();
    let mut factor_num: u128 = 1;
    let mut factor_den: u128 = 1;

    if unit.is_empty() {
        return Ok((1, 1, encoded));
    }

    let mut parts: Vec<(i32, &str)> = Vec::new();
    let mut sign = 1;
    let mut start = 0;
    for (i, c) in unit.char_indices() {
        if c == '*' || c == '/' {
            parts.push((sign, &unit[start..i]));
            sign = if c == '/' { -1 } else { 1 };
            start = i + 1;
        }
    }
    parts.push((sign, &unit[start..]));

    for (sign, part) in parts {
        let (symbol, exp) = match part.split_once('^') {
            Some((s, e)) => (
                s,
                e.parse::<i32>()
                    .map_err(|_| ValueError::InvalidUnitSymbol(part.to_string()))?,
            ),
            None => (part, 1),
        };
        let exp = sign * exp;
        exponent_to_i8(exp)?;

        for (num, den, code, component_exp) in expand_with_prefix(symbol, units)? {
            let exponent = component_exp * exp;
            let (mut n, mut d) = if exponent > 0 { (num, den) } else { (den, num) };
            for _ in 1..exp.unsigned_abs() {
                n = n.checked_mul(if exponent > 0 { num } else { den }).ok_or(ValueError::QuantityOutOfRange)?;
                d = d.checked_mul(if exponent > 0 { den } else { num }).ok_or(ValueError::QuantityOutOfRange)?;
            }
            factor_num = factor_num.checked_mul(n).ok_or(ValueError::QuantityOutOfRange)?;
            factor_den = factor_den.checked_mul(d).ok_or(ValueError::QuantityOutOfRange)?;
            let g = gcd(factor_num, factor_den);
            if g > 1 {
                factor_num /= g;
                factor_den /= g;
            }
            add_unit_and_exponent(&mut encoded, code, exponent)?;
        }
    }

    encoded.sort_by(|(c1, e1), (c2, e2)| match (*e1 > 0, *e2 > 0) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => c2.cmp(c1),
    });

    Ok((factor_num, factor_den, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn q(value: &str, unit: &str) -> Result<Quantity, ValueError> {
        Quantity::parse(value, unit, &SiUnits)
    }

    #[rstest]
    #[case::metre("1", "m", false, 1, 1, vec![(UNIT_METRE, 1)])]
    #[case::kilometre("1.5", "km", false, 1500, 1, vec![(UNIT_METRE, 1)])]
    #[case::per_hour("36", "km/h", false, 10, 1, vec![(UNIT_METRE, 1), (UNIT_SECOND, -1)])]
    #[case::millisecond("5", "ms", false, 1, 200, vec![(UNIT_SECOND, 1)])]
    #[case::euro("-2.50", "€", true, 5, 2, vec![(UNIT_EUR, 1)])]
    #[case::fraction("1/3", "EUR", false, 1, 3, vec![(UNIT_EUR, 1)])]
    #[case::exponent("2e3", "g", false, 2000, 1, vec![(UNIT_GRAM, 1)])]
    #[case::newton("1", "N", false, 1000, 1, vec![(UNIT_GRAM, 1), (UNIT_METRE, 1), (UNIT_SECOND, -2)])]
    #[case::litre("1", "l", false, 1, 1000, vec![(UNIT_METRE, 3)])]
    #[case::cancel("1", "m/m", false, 1, 1, vec![])]
    #[case::square_km("1", "km^2", false, 1_000_000, 1, vec![(UNIT_METRE, 2)])]
    #[case::calendar_year("2", "Cyr", false, 24, 1, vec![(UNIT_CALENDAR_MONTH, 1)])]
    fn test_parse(
        #[case] value: &str,
        #[case] unit: &str,
        #[case] negative: bool,
        #[case] numerator: u128,
        #[case] denominator: u128,
        #[case] encoded: Vec<(u8, i8)>,
    ) {
        let quantity = q(value, unit).unwrap();
        assert_eq!(quantity.is_negative(), negative);
        assert_eq!(quantity.numerator(), numerator);
        assert_eq!(quantity.denominator(), denominator);
        assert_eq!(quantity.unit(), encoded.as_slice());
    }

    #[rstest]
    #[case::unknown("1", "qq", ValueError::InvalidUnitSymbol("qq".to_string()))]
    #[case::bad_prefix("1", "Qm", ValueError::InvalidUnitSymbol("Qm".to_string()))]
    #[case::exponent("1", "m^200", ValueError::UnitExponentOutOfRange(200))]
    #[case::bad_value("1.2.3", "m", ValueError::InvalidQuantity("1.2.3".to_string()))]
    fn test_parse_error(#[case] value: &str, #[case] unit: &str, #[case] expected: ValueError) {
        assert_eq!(q(value, unit), Err(expected));
    }

    #[rstest]
    #[case(0, vec![0])]
    #[case(255, vec![0xff])]
    #[case(256, vec![0x01, 0x00])]
    fn test_minimal_be_bytes(#[case] n: u128, #[case] expected: Vec<u8>) {
        assert_eq!(minimal_be_bytes(n), expected);
    }

    #[test]
    fn test_from_fraction_normalizes_sign() {
        let quantity = Quantity::from_fraction(4, -6).unwrap();
        assert!(quantity.is_negative());
        assert_eq!((quantity.numerator(), quantity.denominator()), (2, 3));
    }
}
