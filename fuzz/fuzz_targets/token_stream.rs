//! Feeds arbitrary bytes, in arbitrary chunkings, to a receive engine.
//!
//! The engine must never panic: any input either decodes, raises a
//! violation that discards one subtree, or abandons the connection with a
//! fatal error. The first input byte selects the chunk size so partial
//! token resume paths get coverage too.

#![no_main]

use std::sync::Arc;

use banana_core::registry::Registry;
use banana_core::unslicer::{CollectingHooks, ReceiveEngine, RootPolicy, RootUnslicer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&chunk_selector, stream)) = data.split_first() else {
        return;
    };
    let chunk_size = usize::from(chunk_selector).max(1);

    let mut engine = ReceiveEngine::new(
        Arc::new(Registry::banana()),
        RootUnslicer::new(RootPolicy::Plain, None),
    );
    let mut hooks = CollectingHooks::default();
    for chunk in stream.chunks(chunk_size) {
        if engine.feed(chunk, &mut hooks).is_err() {
            // fatal framing error: the connection is gone, later chunks
            // must be ignored without panicking
            assert!(engine.is_abandoned());
        }
    }
});
