//! Core of an EchoLink proxy: relays client voice, control and
//! informational traffic between authenticated remote clients and the
//! public EchoLink peer network. Each authorized client is bound to a
//! proxy slot whose external address is exposed to peers on the client's
//! behalf, multiplexing a single TCP control channel with the downstream
//! EchoLink TCP and UDP flows.

pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod registry;

/// TCP port EchoLink clients contact the proxy on, by convention.
pub const DEFAULT_PROXY_PORT: u16 = 8100;
/// TCP port EchoLink peers accept data connections on.
pub const PEER_TCP_PORT: u16 = 5200;
/// UDP port carrying EchoLink audio data.
pub const PEER_UDP_DATA_PORT: u16 = 5199;
/// UDP port carrying EchoLink control traffic.
pub const PEER_UDP_CTRL_PORT: u16 = 5198;

pub use crate::config::ProxyConfig;
pub use crate::error::{ProxyError, ProxyResult};
pub use crate::proxy::{ProxyInstance, ShutdownHandle};
