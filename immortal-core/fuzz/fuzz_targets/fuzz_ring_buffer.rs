//! Fuzz target for the replay ring buffer
//!
//! Interprets the input as a capacity followed by a sequence of writes and
//! checks every `read_last` against a plain model that keeps all bytes.

#![no_main]

use immortal_core::pipe::RingBuffer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&cap, mut rest)) = data.split_first() else {
        return;
    };
    let capacity = usize::from(cap % 64) + 1;
    let ring = RingBuffer::new(capacity);
    let mut model: Vec<u8> = Vec::new();

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len % 96).min(tail.len());
        let (chunk, next) = tail.split_at(len);
        rest = next;

        let held_before = model.len().min(capacity);
        let (written, evicted) = ring.write(chunk);
        if chunk.len() > capacity {
            // Oversized input reports only its own dropped prefix
            assert_eq!((written, evicted), (capacity, chunk.len() - capacity));
        } else {
            let free = capacity - held_before;
            assert_eq!((written, evicted), (chunk.len(), chunk.len().saturating_sub(free)));
        }
        model.extend_from_slice(chunk);
        let held = model.len().min(capacity);
        assert_eq!(ring.len(), held);

        for n in 0..=held {
            let expected = &model[model.len() - n..];
            match ring.read_last(n) {
                Ok(bytes) => assert_eq!(bytes, expected),
                Err(_) => assert!(n == 0 && held == 0),
            }
        }
        assert!(ring.read_last(held + 1).is_err());
    }
});
