pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod driver;
pub mod error;
pub mod kafka;
pub mod partition;
pub mod source;
pub mod test_utils;
pub mod worker;
