#![no_main]

use libfuzzer_sys::fuzz_target;
use meridian::block::Block;

fuzz_target!(|data: &[u8]| {
    let _ = Block::decode(data);
});
