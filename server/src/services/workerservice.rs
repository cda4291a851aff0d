mod authorizer;
use self::authorizer::Authorizer;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use protobuf::status_response::StatusType;
use protobuf::worker_service_server::WorkerService;
use protobuf::{Command, Empty, JobId, Log, StatusResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Request, Response, Status};
use uuid::Uuid;
use worklib::error::Error as WorkerError;
use worklib::types::StatusCode;
use worklib::Worker;

use crate::PrincipalExtension;

// tonic wraps the service in an Arc internally, so no synchronization
// wrapper is needed here.
pub struct WorkerApiService {
    worker: Worker,
    authorizer: Authorizer,
}

impl WorkerApiService {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            authorizer: Authorizer::new(),
        }
    }

    /// Reads the principal recorded by the certificate interceptor.
    fn principal<T>(req: &Request<T>) -> Result<String, Status> {
        req.extensions()
            .get::<PrincipalExtension>()
            .map(|ext| ext.principal.clone())
            .ok_or_else(not_found)
    }

    /// Parses the wire job id and checks that the caller may act on it.
    /// Malformed ids, unknown jobs, and foreign owners are all reported
    /// identically.
    fn authorize(&self, principal: &str, job_id: &str) -> Result<Uuid, Status> {
        let job_id = Uuid::parse_str(job_id).map_err(|_| not_found())?;
        if !self.authorizer.is_authorized(principal, job_id) {
            return Err(not_found());
        }
        Ok(job_id)
    }
}

fn not_found() -> Status {
    Status::not_found("job not found")
}

#[tonic::async_trait]
impl WorkerService for WorkerApiService {
    type GetLogsStream = LogStream;

    async fn submit(&self, req: Request<Command>) -> Result<Response<JobId>, Status> {
        let principal = Self::principal(&req)?;
        let command = req.into_inner().command;

        let job_id = self.worker.submit(&command).map_err(|err| match err {
            WorkerError::EmptyCommand => Status::invalid_argument(err.to_string()),
            err => Status::internal(err.to_string()),
        })?;

        // The owner must be on record before the id escapes to the client,
        // or an immediate follow-up call could be refused.
        self.authorizer.record_owner(job_id, &principal);
        Ok(Response::new(JobId {
            id: job_id.to_string(),
        }))
    }

    async fn stop(&self, req: Request<JobId>) -> Result<Response<Empty>, Status> {
        let principal = Self::principal(&req)?;
        let job_id = self.authorize(&principal, &req.get_ref().id)?;

        self.worker.stop(job_id).await.map_err(|err| match err {
            WorkerError::NotFound => not_found(),
            err => Status::internal(err.to_string()),
        })?;
        Ok(Response::new(Empty {}))
    }

    async fn status(&self, req: Request<JobId>) -> Result<Response<StatusResponse>, Status> {
        let principal = Self::principal(&req)?;
        let job_id = self.authorize(&principal, &req.get_ref().id)?;

        let status = self.worker.status(job_id).map_err(|_| not_found())?;
        let status_type = match status.code {
            StatusCode::Running => StatusType::Running,
            StatusCode::Completed => StatusType::Completed,
            StatusCode::Stopped => StatusType::Stopped,
        };
        Ok(Response::new(StatusResponse {
            status: status_type as i32,
            exit_code: status.exit_code,
        }))
    }

    async fn get_logs(&self, req: Request<JobId>) -> Result<Response<Self::GetLogsStream>, Status> {
        let principal = Self::principal(&req)?;
        let job_id = self.authorize(&principal, &req.get_ref().id)?;

        let cancel = CancellationToken::new();
        let mut reader = self
            .worker
            .logs(job_id, cancel.clone())
            .map_err(|_| not_found())?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => {
                        if let Some(line) = lines.flush() {
                            let _ = tx.send(Ok(Log { log_line: line })).await;
                        }
                        break;
                    }
                    Ok(n) => {
                        lines.push(&chunk[..n]);
                        while let Some(line) = lines.next_line() {
                            if tx.send(Ok(Log { log_line: line })).await.is_err() {
                                // receiver dropped, the client has gone away
                                return;
                            }
                        }
                    }
                    Err(_) => break, // cancelled
                }
            }
        });

        Ok(Response::new(LogStream {
            inner: ReceiverStream::new(rx),
            _cancel: cancel.drop_guard(),
        }))
    }
}

/// Response stream for `get_logs`.
///
/// Holds the reader's cancellation token so that dropping the stream on
/// client disconnect unblocks the reader task instead of leaving it parked
/// on an idle buffer.
pub struct LogStream {
    inner: ReceiverStream<Result<Log, Status>>,
    _cancel: DropGuard,
}

impl Stream for LogStream {
    type Item = Result<Log, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Accumulates raw output bytes and splits them into lines for the wire,
/// with the newline terminator (and a preceding carriage return) removed.
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Remaining bytes as a final, unterminated line.
    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
