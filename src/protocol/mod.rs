//! Wire protocol
//!
//! Framing ([`frame`]), the per-exchange connection ([`connection`]) and
//! the TLS layer underneath it ([`tls`], with OpenSSL PSK sessions in
//! [`psk`]).

pub mod connection;
pub mod error;
pub mod frame;
#[cfg(feature = "tls-psk")]
pub mod psk;
pub mod tls;

pub use connection::{AcceptOptions, ConnectOptions, Connection, Request, exchange};
pub use error::{TlsError, TransportError};
pub use tls::{TlsContexts, TlsMode, TlsRegistry};
