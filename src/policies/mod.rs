//! Cache policy implementations for the store.

pub mod lru;
pub mod moka;

pub use lru::LruPolicy;
pub use moka::{MokaPolicy, MokaPolicyConfig};
