pub mod broadcast;
pub mod db;
pub mod error;
pub mod models;
pub mod reconcile;

pub use error::{Error, ErrorKind, Result, UpstreamError};
