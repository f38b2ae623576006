//! Exhaustively hostile inputs for the header scanner: it must classify
//! every byte string as complete, incomplete, or fatal, without panics.

#![no_main]

use banana_proto::codec::{scan_header, HeaderScan};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match scan_header(data) {
        Ok(HeaderScan::Complete(header)) => {
            // consumed never exceeds the input
            assert!(header.consumed <= data.len());
        }
        Ok(HeaderScan::NeedMore) | Err(_) => {}
    }
});
