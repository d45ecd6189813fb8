use std::time::Instant;

mod conn;
mod err;
mod msg;
mod params;

mod client;
mod server;

pub use client::Client;
pub use err::Error;
pub use msg::{checksum, decode, Kind, Message};
pub use params::Params;
pub use server::Server;

/// Milliseconds until `deadline`, rounded up so a poll never wakes short of
/// the next epoch tick.
pub(crate) fn millis_until(deadline: Instant) -> i32 {
    let now = Instant::now();
    if deadline <= now {
        return 0;
    }
    (deadline - now)
        .as_millis()
        .saturating_add(1)
        .min(i32::MAX as u128) as i32
}
