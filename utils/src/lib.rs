//! Leverage common functionality across the rangefetch crates.

pub mod signal;

/// Construct a [std::num::NonZeroUsize] from a literal or expression, panicking if it is zero.
///
/// Intended for constants and tests where the value is known to be non-zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(v) => v,
            None => panic!("value must be non-zero"),
        }
    };
}
