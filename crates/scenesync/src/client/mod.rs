//! Headless relay client: a transport-free session state machine and a
//! tokio-tungstenite driver that keeps it connected.

pub mod connection;
pub mod session;

pub use connection::RelayClient;
pub use session::{ClientEvent, ClientSession};
