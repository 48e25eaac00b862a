//! Adapters for the channel engine and balance source ports.

pub mod in_memory;
pub mod wallet;
