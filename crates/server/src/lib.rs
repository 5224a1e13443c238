//! Hangar server
//!
//! Publishes a fixed set of named datasets over Arrow Flight. Each dataset is
//! a table registered with a [`hangar_engine::QueryEngine`]; clients discover
//! datasets with `ListFlights`/`GetFlightInfo` and stream them with `DoGet`.

pub mod catalog;
pub mod config;
pub mod error;
pub mod flight;
pub mod server;
pub mod ticket;

pub use catalog::{Dataset, DatasetCatalog};
pub use config::Settings;
pub use error::ServerError;
pub use flight::{HangarFlightService, ServiceOptions, ACTION_RELOAD, ACTION_SHUTDOWN};
pub use server::{FlightServer, ServerState};
pub use ticket::{ResolvedTicket, TicketRegistry};
