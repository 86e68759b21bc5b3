pub mod config;
pub mod protocol;

pub use config::*;
pub use protocol::*;
