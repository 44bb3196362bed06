//! chatgate-core — wire primitives, key derivation, RFC 6455 helpers and
//! configuration. Pure code with no runtime dependency; the async transport
//! layer lives in chatgate-net.

pub mod config;
pub mod crypto;
pub mod http;
pub mod websocket;
pub mod wire;

pub use crypto::{CryptoError, ShareKey};
pub use wire::{EnvelopeHeader, WireError, Writer};
