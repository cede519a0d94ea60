#![no_main]

use libfuzzer_sys::fuzz_target;
use pyrite_codec::{read_var_uint, write_var_uint};

fuzz_target!(|data: &[u8]| {
    if let Ok((value, consumed)) = read_var_uint(data, 0) {
        assert!(consumed <= data.len());
        let mut out = Vec::new();
        // Any value accepted on read must be writable again.
        write_var_uint(&mut out, value).unwrap();
    }
});
