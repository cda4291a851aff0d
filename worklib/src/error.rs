use std::io;
use std::result;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("job not found")]
    NotFound,
    #[error("no command supplied")]
    EmptyCommand,
    #[error("failed to start job: {0}")]
    SpawnFailed(#[source] io::Error),
    #[error("failed to stop job")]
    StopFailed,
}

pub type Result<T> = result::Result<T, Error>;
