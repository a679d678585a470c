pub mod config;
pub mod error;
pub mod ingest;
pub mod server;
pub mod staging;
pub mod store;
pub mod table;

pub use config::Config;
pub use error::{ErrorKind, Operation, ServiceError, ServiceResult};
pub use ingest::{ingest, IngestReport};
pub use store::{Row, Store};
