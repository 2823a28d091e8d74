// telemux-api: wire protocol, websocket transport and REST client for the
// IoT platform's telemetry plugin.

pub mod auth;
pub mod error;
pub mod rest;
pub mod telemetry;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use rest::RestClient;
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{Connector, SocketEvent, SocketHandle, WsConnector};
