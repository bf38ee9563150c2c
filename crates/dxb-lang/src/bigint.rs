use std::fmt;

/// Integer of arbitrary size as sign and big-endian magnitude.
///
/// Only what literal encoding needs is provided: parsing from a radix,
/// narrowing to `i64` and access to the magnitude bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BigInt {
    negative: bool,
    magnitude: Vec<u8>,
}

impl BigInt {
    /// Parses `digits` in `radix` (2..=16). Underscores are ignored.
    pub fn from_str_radix(digits: &str, radix: u32) -> Option<Self> {
        let (negative, digits) = match digits.as_bytes().first() {
            Some(b'-') => (true, &digits[1..]),
            Some(b'+') => (false, &digits[1..]),
            _ => (false, digits),
        };

        let mut magnitude: Vec<u8> = Vec::new();
        let mut seen_digit = false;

        for c in digits.chars().filter(|c| *c != '_') {
            let d = c.to_digit(radix)?;
            seen_digit = true;
            Self::mul_add(&mut magnitude, radix, d);
        }

        if !seen_digit {
            return None;
        }

        Some(Self::normalized(negative, magnitude))
    }

    pub fn from_i128(value: i128) -> Self {
        let negative = value < 0;
        let magnitude = value.unsigned_abs().to_be_bytes().to_vec();
        Self::normalized(negative, magnitude)
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    /// Big-endian magnitude without leading zero bytes (empty for zero).
    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }

    pub fn to_i64(&self) -> Option<i64> {
        if self.magnitude.len() > 8 {
            return None;
        }
        let unsigned = self
            .magnitude
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64);

        if self.negative {
            if unsigned <= i64::MAX as u64 + 1 {
                Some((unsigned as i64).wrapping_neg())
            } else {
                None
            }
        } else {
            i64::try_from(unsigned).ok()
        }
    }

    fn mul_add(magnitude: &mut Vec<u8>, mul: u32, add: u32) {
        let mut carry = add;
        for byte in magnitude.iter_mut().rev() {
            let v = *byte as u32 * mul + carry;
            *byte = (v & 0xff) as u8;
            carry = v >> 8;
        }
        while carry > 0 {
            magnitude.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    fn normalized(negative: bool, magnitude: Vec<u8>) -> Self {
        let first = magnitude
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(magnitude.len());
        let magnitude = magnitude[first..].to_vec();
        Self {
            negative: negative && !magnitude.is_empty(),
            magnitude,
        }
    }

    fn div_small(magnitude: &[u8], divisor: u32) -> (Vec<u8>, u32) {
        let mut rem = 0u32;
        let mut out = Vec::with_capacity(magnitude.len());
        for b in magnitude {
            let cur = (rem << 8) | *b as u32;
            out.push((cur / divisor) as u8);
            rem = cur % divisor;
        }
        let first = out.iter().position(|b| *b != 0).unwrap_or(out.len());
        (out[first..].to_vec(), rem)
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0");
        }
        let mut digits = Vec::new();
        let mut current = self.magnitude.clone();
        while !current.is_empty() {
            let (q, r) = Self::div_small(&current, 10);
            digits.push(char::from(b'0' + r as u8));
            current = q;
        }
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", digits.iter().rev().collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::decimal("255", 10, vec![0xff], false)]
    #[case::hex("0100", 16, vec![0x01, 0x00], false)]
    #[case::binary("1_0000_0000", 2, vec![0x01, 0x00], false)]
    #[case::octal("777", 8, vec![0x01, 0xff], false)]
    #[case::negative("-256", 10, vec![0x01, 0x00], true)]
    #[case::zero("000", 10, vec![], false)]
    #[case::negative_zero("-0", 10, vec![], false)]
    fn test_from_str_radix(
        #[case] digits: &str,
        #[case] radix: u32,
        #[case] magnitude: Vec<u8>,
        #[case] negative: bool,
    ) {
        let n = BigInt::from_str_radix(digits, radix).unwrap();
        assert_eq!(n.magnitude(), magnitude.as_slice());
        assert_eq!(n.is_negative(), negative);
    }

    #[rstest]
    #[case("12a", 10)]
    #[case("", 10)]
    #[case("_", 16)]
    fn test_from_str_radix_invalid(#[case] digits: &str, #[case] radix: u32) {
        assert_eq!(BigInt::from_str_radix(digits, radix), None);
    }

    #[rstest]
    #[case("9223372036854775807", Some(i64::MAX))]
    #[case("-9223372036854775808", Some(i64::MIN))]
    #[case("9223372036854775808", None)]
    #[case("-42", Some(-42))]
    fn test_to_i64(#[case] digits: &str, #[case] expected: Option<i64>) {
        assert_eq!(BigInt::from_str_radix(digits, 10).unwrap().to_i64(), expected);
    }

    #[rstest]
    #[case("123456789012345678901234567890")]
    #[case("-98765432109876543210")]
    #[case("0")]
    fn test_display(#[case] digits: &str) {
        assert_eq!(BigInt::from_str_radix(digits, 10).unwrap().to_string(), digits);
    }

    #[test]
    fn test_from_i128() {
        let n = BigInt::from_i128(-0x1_0000_0000_0000_0000);
        assert!(n.is_negative());
        assert_eq!(n.magnitude(), &[1, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
