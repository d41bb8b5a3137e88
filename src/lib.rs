pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod presence;
pub mod router;
pub mod server;
pub mod snowflake;
pub mod store;
pub mod sweeper;

pub use error::{FleetError, Result};
