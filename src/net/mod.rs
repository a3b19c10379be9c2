pub mod dnsbl;
pub mod framing;
pub mod listener;
pub mod tls;
pub mod transport;

pub use framing::FrameReader;
pub use listener::ServerHandle;
pub use transport::Transport;
