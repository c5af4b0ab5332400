//! Helpers shared by the controller crates.

use std::time::Duration;

use futures::future::BoxFuture;

/// Wraps the given error in a boxed future.
pub fn async_error<E: std::error::Error + Send + 'static, T>(
    e: E,
) -> BoxFuture<'static, Result<T, E>> {
    Box::pin(async move { Err(e) })
}

/// Converts a byte count observed over `elapsed` into a rate in kbit/s.
///
/// Returns 0 for an empty interval.
#[inline]
pub fn bytes_to_kbps(bytes: u64, elapsed: Duration) -> u64 {
    let micros = elapsed.as_micros();
    if micros == 0 {
        return 0;
    }

    let bits = bytes as u128 * units::BITS_PER_BYTE as u128;
    // bits / seconds / 1000 == bits * 1000 / micros
    (bits * 1_000 / micros) as u64
}

/// Data rate and size units.
#[allow(non_upper_case_globals)]
pub mod units {
    /// Bits in a byte.
    pub const BITS_PER_BYTE: u64 = 8;
    /// Kilobit, the unit OpenFlow meter bands are expressed in with `OFPMF_KBPS`.
    pub const Kbit: u64 = 1000;
    /// Megabit.
    pub const Mbit: u64 = 1000 * Kbit;
}
