// Locator handling: magnet parsing, content identifiers, and the blocklist.

pub mod blocklist;
pub mod info_hash;
pub mod magnet;

pub use blocklist::Blocklist;
pub use info_hash::InfoHash;
pub use magnet::Locator;
