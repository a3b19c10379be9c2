//! Mail transport server core: SMTP, POP3 and IMAP over plain and TLS TCP.
//!
//! The layering is strict. [`net`] owns sockets, TLS and delimiter framing
//! and knows nothing about mail; [`protocols`] owns parsing, session state
//! and responses and never touches a raw socket; [`backend`] is the seam to
//! storage and authentication.

pub mod backend;
pub mod config;
pub mod error;
pub mod net;
pub mod protocols;

pub use config::Config;
pub use error::{Error, Result};
pub use protocols::{ProtocolServer, ServerContext};
