//! Core of the Android Open Accessory link.
//!
//! This crate knows nothing about a particular USB library. It holds the
//! accessory-mode negotiation, the framed message transport and the
//! connection state machine, all written against small traits
//! ([`negotiation::ControlChannel`], [`transport::Channel`] and
//! [`connection::UsbBackend`]) that a concrete backend implements.

pub mod accessory;
pub mod config;
pub mod connection;
pub mod negotiation;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
