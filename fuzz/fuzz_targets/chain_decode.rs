#![no_main]

use libfuzzer_sys::fuzz_target;
use pyrite_codec::decode_chain;

fuzz_target!(|data: &[u8]| {
    let _ = decode_chain(data);
});
