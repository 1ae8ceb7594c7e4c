pub mod memory;
pub mod polling;
pub mod rest;
pub mod util;

pub use memory::MemoryStore;
pub use polling::PollingChangeFeed;
pub use rest::RestStore;
