pub mod memory;
pub mod postgres;

pub use memory::{MemoryClaim, MemoryStore, VetrinaInfo};
pub use postgres::{PgClaim, PgStore};
