#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)] // Allow unwraps, expects and panics in the test suite

mod server;
mod test_channels;

pub(crate) fn test_init() {
    let _ = env_logger::try_init();
}
