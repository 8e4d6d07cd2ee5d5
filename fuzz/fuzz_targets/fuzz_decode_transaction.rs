#![no_main]

use libfuzzer_sys::fuzz_target;
use meridian::transaction::Transaction;

fuzz_target!(|data: &[u8]| {
    // RLP decoding of a signed transaction: nine fields with variable-width
    // integers and an optional recipient. Must never panic on arbitrary
    // bytes, only return an error.
    let _ = Transaction::decode(data);
});
