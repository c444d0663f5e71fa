// Engine orchestration: session lifecycle, connection tracking and stream bridging.

pub mod bridge;
pub mod connection;
pub mod gateway;
pub mod registry;
pub mod session;
