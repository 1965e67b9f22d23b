//! Shared test utilities for fbdb crates.
//!
//! - [`TestDir`]: managed temporary directory
//! - [`wait_until`]: poll state owned by a background thread
//! - [`crash`]: damage a closed database file the way a crash would
//! - [`strategies`]: proptest generators for keys, records and schemas

#![deny(unsafe_code)]

pub mod crash;
pub mod strategies;

mod test_dir;
pub use test_dir::TestDir;

mod wait;
pub use wait::wait_until;
