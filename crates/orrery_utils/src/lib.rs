//! Various utilities shared by the Orrery crates

pub mod fnv1a;
pub use fnv1a::fnv1a_hash64;
pub use fnv1a::Fnv1aHasher;

mod counter;
pub use counter::Counter;

pub type AnyResult<T = (), E = anyhow::Error> = anyhow::Result<T, E>;

/// Shorthand for `Ok(())`, cause it looks ugly
pub const fn ok<E>() -> Result<(), E> {
    Ok(())
}

/// Aligns the value. Alignment doesn't have to be a power of two, but it can't be zero.
///
/// ```
/// use orrery_utils::align;
/// assert_eq!(16, align(10, 8));
/// assert_eq!(256, align(192, 256));
/// ```
pub const fn align(n: u64, a: u64) -> u64 {
    (n + a - 1) / a * a
}

/// Byte offset of the `index`-th element of an array laid out with a fixed `stride`.
///
/// ```
/// use orrery_utils::aligned_offset;
/// assert_eq!(aligned_offset(256, 3), 768);
/// ```
pub const fn aligned_offset(stride: u64, index: u64) -> u64 {
    stride * index
}

/// Picks a plural or singular noun for log messages.
///
/// ```
/// use orrery_utils::plural;
/// assert_eq!(plural(1, "task", "tasks"), "task");
/// assert_eq!(plural(0, "task", "tasks"), "tasks");
/// ```
pub const fn plural<'a>(count: usize, singular: &'a str, plural: &'a str) -> &'a str {
    if count == 1 {
        singular
    } else {
        plural
    }
}
