//! Contract ABI codec.
//!
//! The system contracts decode their call data with an interpreter over a
//! static method table instead of reflection: each method lists its argument
//! and return types, the 4-byte selector is the keccak256 prefix of the
//! canonical signature, and values are packed with the standard head/tail
//! layout. Only the types the system contracts actually use are supported.

use primitive_types::U256;

use crate::crypto::keccak256;
use crate::Address;

/// Errors from ABI packing/unpacking.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("abi data malformed")]
    Malformed,
    #[error("unknown method selector")]
    UnknownMethod,
    #[error("abi type mismatch")]
    TypeMismatch,
    #[error("unsupported abi type: {0}")]
    UnsupportedType(String),
}

/// The ABI types used across the system and database contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiType {
    Uint64,
    Bool,
    Address,
    AddressArray,
    Str,
    Bytes,
    Bytes32,
    /// `bytesN` for N ≤ 32 (table row ids).
    FixedBytes(usize),
}

impl AbiType {
    /// Canonical name used in method signatures and table schemas.
    pub fn name(&self) -> String {
        match self {
            AbiType::Uint64 => "uint64".into(),
            AbiType::Bool => "bool".into(),
            AbiType::Address => "address".into(),
            AbiType::AddressArray => "address[]".into(),
            AbiType::Str => "string".into(),
            AbiType::Bytes => "bytes".into(),
            AbiType::Bytes32 => "bytes32".into(),
            AbiType::FixedBytes(n) => format!("bytes{n}"),
        }
    }

    pub fn parse(name: &str) -> Result<AbiType, AbiError> {
        match name {
            "uint64" => Ok(AbiType::Uint64),
            "bool" => Ok(AbiType::Bool),
            "address" => Ok(AbiType::Address),
            "address[]" => Ok(AbiType::AddressArray),
            "string" => Ok(AbiType::Str),
            "bytes" => Ok(AbiType::Bytes),
            "bytes32" => Ok(AbiType::Bytes32),
            other => {
                if let Some(n) = other.strip_prefix("bytes") {
                    let n: usize = n.parse().map_err(|_| {
                        AbiError::UnsupportedType(other.to_string())
                    })?;
                    if n == 0 || n > 64 {
                        return Err(AbiError::UnsupportedType(other.to_string()));
                    }
                    return Ok(AbiType::FixedBytes(n));
                }
                Err(AbiError::UnsupportedType(other.to_string()))
            }
        }
    }

    fn is_dynamic(&self) -> bool {
        matches!(self, AbiType::AddressArray | AbiType::Str | AbiType::Bytes)
    }

    /// Words this type occupies in the head section. Fixed byte strings
    /// longer than one word (composite row ids) span several.
    fn head_words(&self) -> usize {
        match self {
            AbiType::FixedBytes(n) => n.div_ceil(WORD),
            _ => 1,
        }
    }
}

/// A decoded ABI value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Uint64(u64),
    Bool(bool),
    Address(Address),
    AddressArray(Vec<Address>),
    Str(String),
    Bytes(Vec<u8>),
    FixedBytes(Vec<u8>),
}

impl Value {
    pub fn as_u64(&self) -> Result<u64, AbiError> {
        match self {
            Value::Uint64(v) => Ok(*v),
            _ => Err(AbiError::TypeMismatch),
        }
    }

    pub fn as_bool(&self) -> Result<bool, AbiError> {
        match self {
            Value::Bool(v) => Ok(*v),
            _ => Err(AbiError::TypeMismatch),
        }
    }

    pub fn as_address(&self) -> Result<Address, AbiError> {
        match self {
            Value::Address(v) => Ok(*v),
            _ => Err(AbiError::TypeMismatch),
        }
    }

    pub fn as_addresses(&self) -> Result<&[Address], AbiError> {
        match self {
            Value::AddressArray(v) => Ok(v),
            _ => Err(AbiError::TypeMismatch),
        }
    }

    pub fn as_str(&self) -> Result<&str, AbiError> {
        match self {
            Value::Str(v) => Ok(v),
            _ => Err(AbiError::TypeMismatch),
        }
    }

    pub fn as_byte_slice(&self) -> Result<&[u8], AbiError> {
        match self {
            Value::Bytes(v) | Value::FixedBytes(v) => Ok(v),
            _ => Err(AbiError::TypeMismatch),
        }
    }
}

/// One entry of a contract's static method table.
#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub name: &'static str,
    pub inputs: &'static [AbiType],
    pub outputs: &'static [AbiType],
}

impl Method {
    /// Canonical signature, e.g. `vote(address[])`.
    pub fn signature(&self) -> String {
        let args: Vec<String> = self.inputs.iter().map(|t| t.name()).collect();
        format!("{}({})", self.name, args.join(","))
    }

    /// 4-byte call selector.
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Encode a call to this method: selector followed by packed arguments.
    pub fn encode_call(&self, values: &[Value]) -> Result<Vec<u8>, AbiError> {
        let mut out = self.selector().to_vec();
        out.extend_from_slice(&encode_values(self.inputs, values)?);
        Ok(out)
    }

    pub fn decode_inputs(&self, data: &[u8]) -> Result<Vec<Value>, AbiError> {
        decode_values(self.inputs, data)
    }

    pub fn encode_outputs(&self, values: &[Value]) -> Result<Vec<u8>, AbiError> {
        encode_values(self.outputs, values)
    }
}

/// Find the method matching the 4-byte selector prefix of `input`.
/// Returns the method and the remaining argument bytes.
pub fn method_by_selector<'a>(
    methods: &'a [Method],
    input: &'a [u8],
) -> Result<(&'a Method, &'a [u8]), AbiError> {
    if input.len() < 4 {
        return Err(AbiError::Malformed);
    }
    let selector: [u8; 4] = input[..4].try_into().map_err(|_| AbiError::Malformed)?;
    let method = methods
        .iter()
        .find(|m| m.selector() == selector)
        .ok_or(AbiError::UnknownMethod)?;
    Ok((method, &input[4..]))
}

const WORD: usize = 32;

fn pad_right(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % WORD;
    if rem != 0 {
        out.resize(out.len() + WORD - rem, 0);
    }
    out
}

fn word_u64(value: u64) -> [u8; WORD] {
    let mut out = [0u8; WORD];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

/// Pack `values` (checked against `types`) with the head/tail layout.
pub fn encode_values(types: &[AbiType], values: &[Value]) -> Result<Vec<u8>, AbiError> {
    if types.len() != values.len() {
        return Err(AbiError::TypeMismatch);
    }
    let head_len: usize = types.iter().map(|t| t.head_words() * WORD).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for (ty, value) in types.iter().zip(values) {
        if ty.is_dynamic() {
            head.extend_from_slice(&word_u64((head_len + tail.len()) as u64));
            tail.extend_from_slice(&encode_dynamic(ty, value)?);
        } else {
            head.extend_from_slice(&encode_static(ty, value)?);
        }
    }
    head.extend_from_slice(&tail);
    Ok(head)
}

fn encode_static(ty: &AbiType, value: &Value) -> Result<Vec<u8>, AbiError> {
    match (ty, value) {
        (AbiType::Uint64, Value::Uint64(v)) => Ok(word_u64(*v).to_vec()),
        (AbiType::Bool, Value::Bool(v)) => Ok(word_u64(*v as u64).to_vec()),
        (AbiType::Address, Value::Address(a)) => {
            let mut out = [0u8; WORD];
            out[12..].copy_from_slice(a.as_bytes());
            Ok(out.to_vec())
        }
        (AbiType::Bytes32, Value::FixedBytes(b)) if b.len() == 32 => Ok(b.clone()),
        (AbiType::FixedBytes(n), Value::FixedBytes(b)) if b.len() == *n => Ok(pad_right(b)),
        _ => Err(AbiError::TypeMismatch),
    }
}

fn encode_dynamic(ty: &AbiType, value: &Value) -> Result<Vec<u8>, AbiError> {
    match (ty, value) {
        (AbiType::Str, Value::Str(s)) => {
            let mut out = word_u64(s.len() as u64).to_vec();
            out.extend_from_slice(&pad_right(s.as_bytes()));
            Ok(out)
        }
        (AbiType::Bytes, Value::Bytes(b)) => {
            let mut out = word_u64(b.len() as u64).to_vec();
            out.extend_from_slice(&pad_right(b));
            Ok(out)
        }
        (AbiType::AddressArray, Value::AddressArray(addresses)) => {
            let mut out = word_u64(addresses.len() as u64).to_vec();
            for address in addresses {
                let mut word = [0u8; WORD];
                word[12..].copy_from_slice(address.as_bytes());
                out.extend_from_slice(&word);
            }
            Ok(out)
        }
        _ => Err(AbiError::TypeMismatch),
    }
}

/// Unpack `data` into values of the given `types`.
pub fn decode_values(types: &[AbiType], data: &[u8]) -> Result<Vec<Value>, AbiError> {
    let mut out = Vec::with_capacity(types.len());
    let mut head_offset = 0usize;
    for ty in types {
        if ty.is_dynamic() {
            let offset = word_to_usize(&word_at(data, head_offset)?, data.len())?;
            out.push(decode_dynamic(ty, data, offset)?);
        } else {
            out.push(decode_static(ty, data, head_offset)?);
        }
        head_offset += ty.head_words() * WORD;
    }
    Ok(out)
}

fn word_at(data: &[u8], offset: usize) -> Result<[u8; WORD], AbiError> {
    let end = offset.checked_add(WORD).ok_or(AbiError::Malformed)?;
    if data.len() < end {
        return Err(AbiError::Malformed);
    }
    let mut out = [0u8; WORD];
    out.copy_from_slice(&data[offset..end]);
    Ok(out)
}

/// Read a word as an offset or element count. No valid offset or count can
/// exceed the input length, so anything beyond `bound` is malformed; this
/// keeps claimed sizes from ever driving an allocation past the data that
/// backs them.
fn word_to_usize(word: &[u8; WORD], bound: usize) -> Result<usize, AbiError> {
    let value = U256::from_big_endian(word);
    if value > U256::from(bound as u64) {
        return Err(AbiError::Malformed);
    }
    Ok(value.as_usize())
}

fn decode_static(ty: &AbiType, data: &[u8], offset: usize) -> Result<Value, AbiError> {
    let word = word_at(data, offset)?;
    match ty {
        AbiType::Uint64 => {
            if word[..24].iter().any(|&b| b != 0) {
                return Err(AbiError::Malformed);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&word[24..]);
            Ok(Value::Uint64(u64::from_be_bytes(bytes)))
        }
        AbiType::Bool => {
            if word[..31].iter().any(|&b| b != 0) {
                return Err(AbiError::Malformed);
            }
            match word[31] {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                _ => Err(AbiError::Malformed),
            }
        }
        AbiType::Address => Ok(Value::Address(Address::from_slice(&word[12..]))),
        AbiType::Bytes32 => Ok(Value::FixedBytes(word.to_vec())),
        AbiType::FixedBytes(n) => Ok(Value::FixedBytes(slice_at(data, offset, *n)?.to_vec())),
        _ => Err(AbiError::TypeMismatch),
    }
}

fn decode_dynamic(ty: &AbiType, data: &[u8], offset: usize) -> Result<Value, AbiError> {
    let len = word_to_usize(&word_at(data, offset)?, data.len())?;
    let payload_start = offset + WORD;
    match ty {
        AbiType::Str => {
            let payload = slice_at(data, payload_start, len)?;
            let text = std::str::from_utf8(payload).map_err(|_| AbiError::Malformed)?;
            Ok(Value::Str(text.to_string()))
        }
        AbiType::Bytes => Ok(Value::Bytes(slice_at(data, payload_start, len)?.to_vec())),
        AbiType::AddressArray => {
            // the length word is attacker-controlled; require the payload to
            // actually hold `len` words before reserving anything
            let payload_len = len.checked_mul(WORD).ok_or(AbiError::Malformed)?;
            slice_at(data, payload_start, payload_len)?;
            let mut addresses = Vec::with_capacity(len);
            for i in 0..len {
                let word = word_at(data, payload_start + i * WORD)?;
                addresses.push(Address::from_slice(&word[12..]));
            }
            Ok(Value::AddressArray(addresses))
        }
        _ => Err(AbiError::TypeMismatch),
    }
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(len).ok_or(AbiError::Malformed)?;
    if data.len() < end {
        return Err(AbiError::Malformed);
    }
    Ok(&data[offset..end])
}
