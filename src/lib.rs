//! Protocol-sniffing proxy: a single TCP endpoint that serves both HTTP and
//! SOCKS5 clients, relays traffic to the requested upstream, and exposes a
//! live monitoring view (REST + WebSocket) of every in-flight connection.

pub mod broadcast;
pub mod config;
pub mod domain;
pub mod error;
pub mod http;
pub mod monitor;
pub mod registry;
pub mod relay;
pub mod socks;
