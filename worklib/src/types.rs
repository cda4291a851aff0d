use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle state of a submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Running,
    Completed,
    Stopped,
}

/// Point-in-time snapshot of a job's state.
///
/// `exit_code` is only meaningful once the code is `Completed` or `Stopped`;
/// while the job is running it reads as 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub exit_code: i32,
}

impl Status {
    pub fn running() -> Self {
        Status {
            code: StatusCode::Running,
            exit_code: 0,
        }
    }
}
