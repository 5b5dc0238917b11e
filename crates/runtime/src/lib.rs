//! Filesystem and environment collaborators for the session layer.
//!
//! Everything here is consulted at well-defined moments only: the environment
//! once when a configuration is built, config files and the ticket file when a
//! connection is opened or a login/logout persists a ticket.

pub mod config;
pub mod env;
pub mod error;
pub mod tickets;

pub use config::{ConfigFile, find_config_file};
pub use env::{EnvDefaults, default_ticket_path};
pub use error::{Error, Result};
pub use tickets::{TicketEntry, TicketFile};
