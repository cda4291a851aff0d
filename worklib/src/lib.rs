pub mod buffer;
pub mod error;
pub mod isolation;
pub mod types;
mod worker;

pub use types::{JobId, Status, StatusCode};
pub use worker::Worker;
