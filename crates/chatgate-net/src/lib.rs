//! chatgate-net — the async transport layer of the gateway.
//!
//! A connection arrives at the [`Server`], is wrapped in a [`Session`] by
//! the [`Manager`], sniffed once to pick a codec (binary TCP, HTTP or
//! WebSocket) and then read message by message until it closes.

pub mod codec;
pub mod error;
pub mod manager;
pub mod reader;
pub mod server;
pub mod session;
pub mod sniff;
pub mod websocket;

pub use codec::{Codec, CodecRegistry, KeyState, OutMessage};
pub use error::{HttpError, ManagerError, ServerError, SessionError};
pub use manager::Manager;
pub use reader::Reader;
pub use server::{serve, Dispatcher, Server};
pub use session::{ConnType, Session, SessionSettings};
