use std::fmt;
use std::ops::Neg;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{ChainError, ChainResult};

/// Number of fractional decimal digits carried by every [`Amount`].
pub const AMOUNT_DECIMALS: u32 = 8;

const SCALE: i128 = 100_000_000;

/// Signed fixed-point ledger amount with eight fractional digits.
///
/// Stored as raw `i128` units of 10^-8, which comfortably covers the total
/// supply while keeping arithmetic exact. Renders as a plain decimal string
/// and, for the legacy storage columns, as base64 over the minimal
/// big-endian two's-complement byte form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Builds an amount from raw 10^-8 units.
    pub fn from_units(units: i128) -> Self {
        Self(units)
    }

    /// Builds an amount from a whole number of coins.
    pub fn from_whole(value: i64) -> Self {
        Self(value as i128 * SCALE)
    }

    pub fn units(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(&self, other: &Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Minimal big-endian two's-complement byte form: leading bytes that
    /// carry no information beyond the sign are stripped, and at least one
    /// byte is always produced.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let raw = self.0.to_be_bytes();
        let mut start = 0;
        while start < raw.len() - 1 {
            let redundant = if self.0 < 0 {
                raw[start] == 0xff && raw[start + 1] >= 0x80
            } else {
                raw[start] == 0x00 && raw[start + 1] < 0x80
            };
            if !redundant {
                break;
            }
            start += 1;
        }
        raw[start..].to_vec()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> ChainResult<Self> {
        if bytes.is_empty() || bytes.len() > 16 {
            return Err(ChainError::Codec(format!(
                "invalid amount byte length {}",
                bytes.len()
            )));
        }
        let fill = if bytes[0] >= 0x80 { 0xff } else { 0x00 };
        let mut raw = [fill; 16];
        raw[16 - bytes.len()..].copy_from_slice(bytes);
        Ok(Self(i128::from_be_bytes(raw)))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_be_bytes())
    }

    pub fn from_base64(encoded: &str) -> ChainResult<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|err| ChainError::Codec(format!("invalid base64 amount: {err}")))?;
        Self::from_be_bytes(&bytes)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let negative = self.0 < 0;
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / SCALE as u128;
        let fraction = magnitude % SCALE as u128;
        if negative {
            write!(f, "-")?;
        }
        if fraction == 0 {
            write!(f, "{whole}")
        } else {
            let digits = format!("{fraction:08}");
            write!(f, "{whole}.{}", digits.trim_end_matches('0'))
        }
    }
}

impl FromStr for Amount {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChainError::Codec(format!("invalid amount '{s}'"));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole_str, fraction_str) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole_str.is_empty() || fraction_str.len() > AMOUNT_DECIMALS as usize {
            return Err(invalid());
        }
        let whole: i128 = whole_str.parse().map_err(|_| invalid())?;
        let mut fraction: i128 = 0;
        if !fraction_str.is_empty() {
            fraction = fraction_str.parse().map_err(|_| invalid())?;
            for _ in fraction_str.len()..AMOUNT_DECIMALS as usize {
                fraction *= 10;
            }
        }
        let units = whole
            .checked_mul(SCALE)
            .and_then(|w| w.checked_add(fraction))
            .ok_or_else(invalid)?;
        Ok(Amount(if negative { -units } else { units }))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
