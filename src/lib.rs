//! Serialized asynchronous Bluetooth LE GATT client with an in-process GATT
//! simulator.
//!
//! The platform GATT transport permits at most one outstanding operation per
//! link (and, for RSSI reads, per host adapter). [`client::Client`] turns that
//! callback-driven transport into suspending operations by acquiring a
//! [`lock::RequestLock`] slot for each operation class and matching the
//! late-arriving completion event back to its waiter. [`sim::Hub`] provides a
//! complete two-sided simulation of the protocol, so the same client code runs
//! deterministically without radio hardware.

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::empty_drop)]
#![warn(clippy::exit)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::print_stdout)]
#![warn(clippy::rc_mutex)]
#![warn(clippy::str_to_string)]
#![warn(clippy::todo)]
#![warn(clippy::try_err)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod client;
pub mod event;
pub mod gatt;
pub mod le;
pub mod lock;
pub mod request;
pub mod sim;
mod util;

type SyncMutex<T> = parking_lot::Mutex<T>;

#[cfg(test)]
pub(crate) fn init_log() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
