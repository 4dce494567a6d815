use std::hash::Hasher;

pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
pub const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// Performs a 64-bit FNV-1a hash over a byte slice.
///
/// ## Example
/// ```
/// use orrery_utils::fnv1a_hash64;
///
/// assert_eq!(fnv1a_hash64(b""), 0xcbf29ce484222325);
/// assert_eq!(fnv1a_hash64(b"a"), 0xaf63dc4c8601ec8c);
/// ```
pub fn fnv1a_hash64(buffer: &[u8]) -> u64 {
    let mut hasher = Fnv1aHasher::new();
    hasher.write(buffer);
    hasher.finish()
}

/// Incremental 64-bit FNV-1a hasher. It also implements [`std::hash::Hasher`], so any [`Hash`]
/// type can be fed into it for a stable structural hash.
///
/// [`Hash`]: std::hash::Hash
#[derive(Debug, Clone, Copy)]
pub struct Fnv1aHasher {
    state: u64,
}

impl Fnv1aHasher {
    pub const fn new() -> Self {
        Self {
            state: OFFSET_BASIS,
        }
    }
}

impl Default for Fnv1aHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Fnv1aHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.state
    }
}
