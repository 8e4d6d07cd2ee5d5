#![no_main]

use libfuzzer_sys::fuzz_target;
use meridian::block::Header;

fuzz_target!(|data: &[u8]| {
    // Header decoding includes the variable-length delegate-diff tail whose
    // items are 2 or 21 byte strings. Arbitrary input must error cleanly.
    let _ = Header::decode(data);
});
