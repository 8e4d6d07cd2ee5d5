#![no_main]

use libfuzzer_sys::fuzz_target;
use meridian::contracts::abi::{decode_values, AbiType};

fuzz_target!(|data: &[u8]| {
    // The call-data decoder handles attacker-supplied offsets and lengths;
    // every out-of-bounds shape must surface as Malformed, never a panic.
    let types = [
        AbiType::Uint64,
        AbiType::AddressArray,
        AbiType::Str,
        AbiType::Bytes,
        AbiType::FixedBytes(40),
    ];
    let _ = decode_values(&types, data);
});
