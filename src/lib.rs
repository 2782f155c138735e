//! ledgerwire - APDU transport for Ledger hardware signers
//!
//! Frames command APDUs into fixed-size HID reports, reassembles the
//! device's response, interprets its status word and recovers from the
//! platform glitch that occasionally replaces a response with a junk report.

pub mod app;
pub mod config;
pub mod device;
pub mod discovery;
pub mod exchange;
pub mod protocol;
