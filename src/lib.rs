//! HTTP gateway that streams magnet-addressed swarm content with byte-range support.
//!
//! A request flows through [`locator`] (parse, canonicalize, blocklist), the
//! [`engine::registry::SessionRegistry`] (one swarm join per info hash), the range
//! negotiator in [`server::range`], and finally an [`engine::bridge::StreamBridge`]
//! that feeds the swarm's byte source into the response body.

pub mod config;
pub mod engine;
pub mod error;
pub mod locator;
pub mod server;
pub mod swarm;

pub use config::GatewayConfig;
pub use engine::gateway::Gateway;
pub use error::GatewayError;
pub use server::handler::GatewayServer;
