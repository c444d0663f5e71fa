// HTTP surface: axum routing and byte-range negotiation.

pub mod handler;
pub mod range;
