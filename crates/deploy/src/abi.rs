//! Typed arguments and ABI encoding helpers.
//!
//! Arguments are declared loosely in configuration (numbers, strings, lists)
//! and coerced to the parameter types published in the artifact's ABI at
//! encoding time.

use std::time::Duration;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, Specifier},
    json_abi::{Function, JsonAbi, Param},
    primitives::{Address, B256, Bytes, I256, Selector, U256},
};
use serde::{Deserialize, Serialize};

/// A constructor or call argument as declared by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Number(u64),
    Address(Address),
    /// Decimal or `0x` integers, hex bytes, or plain strings.
    Text(String),
    List(Vec<ArgValue>),
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<Duration> for ArgValue {
    fn from(value: Duration) -> Self {
        Self::Number(value.as_secs())
    }
}

impl From<Address> for ArgValue {
    fn from(value: Address) -> Self {
        Self::Address(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<Address>> for ArgValue {
    fn from(value: Vec<Address>) -> Self {
        Self::List(value.into_iter().map(Self::Address).collect())
    }
}

impl ArgValue {
    /// Coerce this value into an ABI value of type `ty`.
    pub fn coerce(&self, ty: &DynSolType) -> Result<DynSolValue, String> {
        match (ty, self) {
            (DynSolType::Bool, Self::Bool(value)) => Ok(DynSolValue::Bool(*value)),
            (DynSolType::Uint(bits), Self::Number(value)) => uint(U256::from(*value), *bits),
            (DynSolType::Uint(bits), Self::Text(text)) => {
                let value = text
                    .parse::<U256>()
                    .map_err(|e| format!("`{text}` is not a uint{bits}: {e}"))?;
                uint(value, *bits)
            }
            (DynSolType::Uint(bits), Self::Address(address)) => {
                uint(U256::from_be_slice(address.as_slice()), *bits)
            }
            (DynSolType::Int(bits), Self::Number(value)) => {
                int(I256::from_raw(U256::from(*value)), *bits)
            }
            (DynSolType::Int(bits), Self::Text(text)) => {
                let value = text
                    .parse::<I256>()
                    .map_err(|e| format!("`{text}` is not an int{bits}: {e}"))?;
                int(value, *bits)
            }
            (DynSolType::Address, Self::Address(address)) => Ok(DynSolValue::Address(*address)),
            (DynSolType::Address, Self::Text(text)) => text
                .parse::<Address>()
                .map(DynSolValue::Address)
                .map_err(|e| format!("`{text}` is not an address: {e}")),
            (DynSolType::String, Self::Text(text)) => Ok(DynSolValue::String(text.clone())),
            (DynSolType::Bytes, Self::Text(text)) => decode_hex(text).map(DynSolValue::Bytes),
            // 20-byte hex strings deserialize as addresses.
            (DynSolType::Bytes, Self::Address(address)) => {
                Ok(DynSolValue::Bytes(address.to_vec()))
            }
            (DynSolType::FixedBytes(size), Self::Text(text)) => fixed_bytes(&decode_hex(text)?, *size),
            (DynSolType::FixedBytes(size), Self::Address(address)) => {
                fixed_bytes(address.as_slice(), *size)
            }
            (DynSolType::Array(inner), Self::List(items)) => items
                .iter()
                .map(|item| item.coerce(inner))
                .collect::<Result<Vec<_>, _>>()
                .map(DynSolValue::Array),
            (DynSolType::FixedArray(inner, len), Self::List(items)) => {
                if items.len() != *len {
                    return Err(format!("expected {len} elements, got {}", items.len()));
                }
                items
                    .iter()
                    .map(|item| item.coerce(inner))
                    .collect::<Result<Vec<_>, _>>()
                    .map(DynSolValue::FixedArray)
            }
            (DynSolType::Tuple(types), Self::List(items)) => {
                if items.len() != types.len() {
                    return Err(format!(
                        "expected a tuple of {}, got {} values",
                        types.len(),
                        items.len()
                    ));
                }
                types
                    .iter()
                    .zip(items)
                    .map(|(ty, item)| item.coerce(ty))
                    .collect::<Result<Vec<_>, _>>()
                    .map(DynSolValue::Tuple)
            }
            (ty, value) => Err(format!("cannot use {value:?} as {}", ty.sol_type_name())),
        }
    }
}

fn uint(value: U256, bits: usize) -> Result<DynSolValue, String> {
    if bits < 256 && value.bit_len() > bits {
        return Err(format!("{value} does not fit in uint{bits}"));
    }
    Ok(DynSolValue::Uint(value, bits))
}

fn int(value: I256, bits: usize) -> Result<DynSolValue, String> {
    // Magnitude bound: 2^(bits-1) - 1 for positive values, 2^(bits-1) for negative ones.
    let magnitude = value.unsigned_abs();
    let fits = if value.is_negative() {
        (magnitude - U256::from(1)).bit_len() < bits
    } else {
        magnitude.bit_len() < bits
    };
    if bits < 256 && !fits {
        return Err(format!("{value} does not fit in int{bits}"));
    }
    Ok(DynSolValue::Int(value, bits))
}

fn fixed_bytes(bytes: &[u8], size: usize) -> Result<DynSolValue, String> {
    if bytes.len() != size {
        return Err(format!("expected {size} bytes, got {}", bytes.len()));
    }
    Ok(DynSolValue::FixedBytes(B256::right_padding_from(bytes), size))
}

fn decode_hex(text: &str) -> Result<Vec<u8>, String> {
    hex::decode(text.trim_start_matches("0x")).map_err(|e| format!("`{text}` is not hex: {e}"))
}

/// ABI-encode `args` against `params`, without any selector.
pub fn encode_params(params: &[Param], args: &[ArgValue]) -> Result<Vec<u8>, String> {
    if params.len() != args.len() {
        return Err(format!(
            "expected {} argument(s), got {}",
            params.len(),
            args.len()
        ));
    }

    let values = params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            let ty = param
                .resolve()
                .map_err(|e| format!("unsupported parameter type `{}`: {e}", param.ty))?;
            arg.coerce(&ty)
                .map_err(|e| format!("parameter `{}`: {e}", param.name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DynSolValue::Tuple(values).abi_encode_params())
}

/// ABI-encode constructor arguments for a contract.
///
/// A contract without a constructor accepts no arguments.
pub fn encode_constructor_args(abi: &JsonAbi, args: &[ArgValue]) -> Result<Vec<u8>, String> {
    match abi.constructor() {
        Some(constructor) => encode_params(&constructor.inputs, args),
        None if args.is_empty() => Ok(Vec::new()),
        None => Err(format!(
            "contract has no constructor but {} argument(s) were given",
            args.len()
        )),
    }
}

/// Find the overload of `method` taking exactly `arity` arguments.
pub fn find_function<'a>(abi: &'a JsonAbi, method: &str, arity: usize) -> Option<&'a Function> {
    abi.function(method)?
        .iter()
        .find(|function| function.inputs.len() == arity)
}

/// Selector-prefixed calldata for a call to `function`.
pub fn encode_call(function: &Function, args: &[ArgValue]) -> Result<Bytes, String> {
    let mut calldata = function.selector().to_vec();
    calldata.extend(encode_params(&function.inputs, args)?);
    Ok(calldata.into())
}

/// Every function selector exposed by an ABI, in declaration order.
pub fn function_selectors(abi: &JsonAbi) -> Vec<Selector> {
    abi.functions().map(Function::selector).collect()
}
