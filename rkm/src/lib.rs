pub mod cli;
pub mod config_store;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod fsutil;
pub mod handoff;
pub mod logging;
pub mod notify;
pub mod process;
pub mod rootpath;
pub mod supervisor;
pub mod update;
pub mod upgrade;

// re-export selected public API
pub use error::{Error, Result};
