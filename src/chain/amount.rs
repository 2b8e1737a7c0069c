//! uint256 quantities as they arrive in chain event JSON.
//!
//! Indexers emit bigints as decimal strings, `0x` hex strings, or (for small
//! values) plain JSON numbers. All of them land in a `U256`; floats never do.

use ethers_core::types::U256;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 10^18, the fixed-point scale of ether and launchpad token amounts.
pub fn wei_scale() -> U256 {
    U256::exp10(18)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PriceError {
    #[error("token amount is zero")]
    ZeroTokenAmount,

    #[error("eth amount {0} overflows when scaled")]
    Overflow(U256),
}

/// Per-unit price: `(eth_amount * 1e18) / token_amount / 1e18`, in integers.
pub fn unit_price(eth_amount: U256, token_amount: U256) -> Result<U256, PriceError> {
    if token_amount.is_zero() {
        return Err(PriceError::ZeroTokenAmount);
    }
    let scaled = eth_amount
        .checked_mul(wei_scale())
        .ok_or(PriceError::Overflow(eth_amount))?;
    Ok(scaled / token_amount / wei_scale())
}

/// Parse a JSON value as a uint256.
pub fn u256_from_json(value: &Value) -> Result<U256, String> {
    match value {
        Value::String(s) => parse_u256_str(s),
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| format!("{n} is not a non-negative integer")),
        other => Err(format!("expected a uint256, got {other}")),
    }
}

fn parse_u256_str(s: &str) -> Result<U256, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() {
            return Err("empty hex quantity".to_string());
        }
        U256::from_str_radix(hex, 16).map_err(|e| format!("{s}: {e:?}"))
    } else {
        U256::from_dec_str(s).map_err(|e| format!("{s}: {e:?}"))
    }
}

/// Parse a JSON value as a u64 (block numbers, timestamps).
pub fn u64_from_json(value: &Value) -> Result<u64, String> {
    let wide = u256_from_json(value)?;
    if wide > U256::from(u64::MAX) {
        return Err(format!("{wide} does not fit in 64 bits"));
    }
    Ok(wide.as_u64())
}

/// Serde adapter for `U256` fields: `#[serde(deserialize_with = "deserialize_u256")]`.
pub fn deserialize_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    u256_from_json(&value).map_err(serde::de::Error::custom)
}

/// Serde adapter for `u64` fields that may arrive as strings.
pub fn deserialize_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    u64_from_json(&value).map_err(serde::de::Error::custom)
}

/// Optional variant of [`deserialize_u64`]; `null` and absent both give `None`.
pub fn deserialize_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => u64_from_json(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
