pub mod config;
pub mod container;
pub mod eradicate;
pub mod error;
pub mod host;
pub mod identity;
pub mod reclaim;
pub mod test_utils;
pub mod utils;
