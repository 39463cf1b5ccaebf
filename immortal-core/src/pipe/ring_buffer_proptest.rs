//! Property-based tests for the replay ring buffer
//!
//! Compares the ring buffer against a plain `Vec` model of everything ever
//! written: whatever the write pattern, the buffer must hold exactly the
//! trailing `min(total, capacity)` bytes.

#[cfg(test)]
mod tests {
    use super::super::ring_buffer::RingBuffer;
    use crate::core::RingBufferError;
    use proptest::prelude::*;

    fn writes() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..30)
    }

    proptest! {
        /// Property: the buffer always holds the trailing bytes of the stream
        #[test]
        fn prop_holds_trailing_bytes(capacity in 1usize..64, chunks in writes()) {
            let rb = RingBuffer::new(capacity);
            let mut model: Vec<u8> = Vec::new();

            for chunk in &chunks {
                rb.write(chunk);
                model.extend_from_slice(chunk);
            }

            let expected_len = model.len().min(capacity);
            prop_assert_eq!(rb.len(), expected_len);

            if expected_len > 0 {
                let tail = rb.read_last(expected_len).unwrap();
                prop_assert_eq!(&tail[..], &model[model.len() - expected_len..]);
            }
        }

        /// Property: any suffix length up to the held size reads back exactly
        #[test]
        fn prop_every_suffix_matches(capacity in 1usize..32, chunks in writes(), pick in any::<prop::sample::Index>()) {
            let rb = RingBuffer::new(capacity);
            let mut model: Vec<u8> = Vec::new();
            for chunk in &chunks {
                rb.write(chunk);
                model.extend_from_slice(chunk);
            }

            let held = rb.len();
            prop_assume!(held > 0);
            let n = pick.index(held) + 1;
            let suffix = rb.read_last(n).unwrap();
            prop_assert_eq!(&suffix[..], &model[model.len() - n..]);
        }

        /// Property: written + evicted accounts for every input byte
        #[test]
        fn prop_write_accounting(capacity in 1usize..32, chunks in writes()) {
            let rb = RingBuffer::new(capacity);
            for chunk in &chunks {
                let before = rb.len();
                let (written, evicted) = rb.write(chunk);

                if chunk.len() > capacity {
                    prop_assert_eq!(written, capacity);
                    prop_assert_eq!(evicted, chunk.len() - capacity);
                } else {
                    prop_assert_eq!(written, chunk.len());
                    prop_assert_eq!(evicted, chunk.len().saturating_sub(capacity - before));
                }
                prop_assert!(rb.len() <= capacity);
            }
        }

        /// Property: asking for more than is held always fails
        #[test]
        fn prop_over_read_fails(capacity in 1usize..32, chunks in writes(), extra in 1usize..10) {
            let rb = RingBuffer::new(capacity);
            for chunk in &chunks {
                rb.write(chunk);
            }
            let held = rb.len();
            let result = rb.read_last(held + extra);
            if held == 0 {
                prop_assert_eq!(result, Err(RingBufferError::Empty));
            } else {
                prop_assert_eq!(
                    result,
                    Err(RingBufferError::Insufficient { requested: held + extra, available: held })
                );
            }
        }
    }
}
