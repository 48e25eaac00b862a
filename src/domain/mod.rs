//! Domain types and the ports the payment client talks through.

pub mod account;
pub mod channel;
pub mod currency;
pub mod ports;
