//! Orchestration of channel lifecycle, balance polling and observer fan-out.
//!
//! [`PaymentClient`] is the entry point. It owns at most one
//! [`ChannelHandle`] and publishes updates through an [`ObserverRegistry`].

pub mod channel;
pub mod client;
pub mod registry;

pub use channel::{ChannelHandle, HandlePhase};
pub use client::PaymentClient;
pub use registry::ObserverRegistry;
