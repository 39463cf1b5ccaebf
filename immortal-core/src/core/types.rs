//! Small identifier types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an immortal stream
///
/// Format: [timestamp:64][random:32][counter:32], unique across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StreamId(pub u128);

impl StreamId {
    /// Wrap a raw id
    #[inline(always)]
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    /// Generate a fresh id
    pub fn generate() -> Self {
        use rand::Rng;
        use std::time::SystemTime;

        thread_local! {
            static COUNTER: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
        }

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let random_part = rand::thread_rng().gen::<u32>();

        let counter = COUNTER.with(|c| {
            let val = c.get();
            c.set(val.wrapping_add(1));
            val
        });

        Self(((timestamp as u128) << 64) | ((random_part as u128) << 32) | (counter as u128))
    }

    /// Raw value
    #[inline(always)]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<StreamId> = (0..1000).map(|_| StreamId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(StreamId::new(0xab).to_string().len(), 32);
        assert!(StreamId::new(0xab).to_string().ends_with("ab"));
    }
}
