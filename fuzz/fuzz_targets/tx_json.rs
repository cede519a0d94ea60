#![no_main]

use libfuzzer_sys::fuzz_target;
use pyrite_codec::Transaction;

fuzz_target!(|data: &[u8]| {
    if let Ok(tx) = serde_json::from_slice::<Transaction>(data) {
        let _ = tx.validate();
        let _ = tx.canonical_bytes();
        let _ = tx.txid();
    }
});
