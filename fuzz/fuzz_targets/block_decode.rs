#![no_main]

use libfuzzer_sys::fuzz_target;
use pyrite_codec::Block;

fuzz_target!(|data: &[u8]| {
    if let Ok(block) = Block::decode(data) {
        let _ = block.encode();
        let _ = block.txids();
    }
});
