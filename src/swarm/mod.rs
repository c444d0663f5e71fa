// Swarm engine abstraction: the gateway's only view of the peer-to-peer layer.

pub mod memory;
pub mod traits;
pub mod webseed;
