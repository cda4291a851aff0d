use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, RwLock};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::buffer::{BroadcastBuffer, LogReader};
use crate::error::{Error, Result};
use crate::isolation::CGroups;
use crate::types::{JobId, Status, StatusCode};

const SIGKILL: i32 = 9;

/// One submitted job. The child process handle itself lives in the observer
/// task; everything callers interact with lives here.
struct Job {
    /// Merged stdout/stderr of the child, in write order.
    output: Arc<BroadcastBuffer>,

    status: RwLock<Status>,

    /// Taken by the first stop call; the observer holds the receiving end.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,

    /// Fired once the observer has recorded the final status.
    terminated: CancellationToken,
}

/// Registry of every job submitted to this process.
///
/// Jobs are never removed: their buffers must stay readable so that clients
/// can stream a finished job's output from the beginning.
#[derive(Default)]
pub struct Worker {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    cgroups: Option<CGroups>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worker that confines every spawned child to the given cgroups.
    pub fn with_cgroups(cgroups: CGroups) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            cgroups: Some(cgroups),
        }
    }

    /// Splits `command` on whitespace, spawns it with piped stdout/stderr,
    /// and returns the identifier of the new job.
    pub fn submit(&self, command: &str) -> Result<JobId> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or(Error::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                error!(command, error = %err, "failed to start job");
                Error::SpawnFailed(err)
            })?;

        if let Some(cgroups) = &self.cgroups {
            if let Some(pid) = child.id() {
                if let Err(err) = cgroups.add_pid(pid) {
                    error!(pid, error = %err, "failed to confine job to cgroups");
                }
            }
        }

        let output = Arc::new(BroadcastBuffer::new());
        let stdout_pump = pump(child.stdout.take(), Arc::clone(&output));
        let stderr_pump = pump(child.stderr.take(), Arc::clone(&output));

        let (kill_tx, kill_rx) = oneshot::channel();
        let job = Arc::new(Job {
            output,
            status: RwLock::new(Status::running()),
            kill_tx: Mutex::new(Some(kill_tx)),
            terminated: CancellationToken::new(),
        });

        let job_id = Uuid::new_v4();
        observe(
            Arc::clone(&job),
            job_id,
            child,
            kill_rx,
            stdout_pump,
            stderr_pump,
        );

        self.jobs.write().unwrap().insert(job_id, job);
        info!(%job_id, "started command: {}", command);
        Ok(job_id)
    }

    /// Kills the job and waits until its final status has been recorded, so
    /// a status query issued right after a successful stop reports `Stopped`.
    pub async fn stop(&self, job_id: JobId) -> Result<()> {
        let job = self.get(job_id)?;
        let kill_tx = job.kill_tx.lock().unwrap().take();
        match kill_tx {
            Some(tx) => tx.send(()).map_err(|_| Error::StopFailed)?,
            // Stopped before, or the child has already been reaped.
            None => return Err(Error::StopFailed),
        }
        job.terminated.cancelled().await;
        Ok(())
    }

    pub fn status(&self, job_id: JobId) -> Result<Status> {
        let job = self.get(job_id)?;
        let status = *job.status.read().unwrap();
        Ok(status)
    }

    /// Returns a reader over the job's merged stdout/stderr, starting at the
    /// first byte the job produced.
    pub fn logs(&self, job_id: JobId, cancel: CancellationToken) -> Result<LogReader> {
        let job = self.get(job_id)?;
        Ok(Arc::clone(&job.output).new_reader(cancel))
    }

    fn get(&self, job_id: JobId) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(Error::NotFound)
    }
}

/// Copies everything the child writes on one pipe into the job's buffer.
fn pump<R>(source: Option<R>, output: Arc<BroadcastBuffer>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut source = source?;
    Some(tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match source.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    if output.write(&buf).is_err() {
                        break;
                    }
                    buf.clear();
                }
                _ => break,
            }
        }
    }))
}

/// Waits for the child to terminate, then records the final status, closes
/// the output buffer, and fires the termination signal, in that order.
fn observe(
    job: Arc<Job>,
    job_id: JobId,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    stdout_pump: Option<JoinHandle<()>>,
    stderr_pump: Option<JoinHandle<()>>,
) {
    tokio::spawn(async move {
        let exit = tokio::select! {
            exit = child.wait() => exit,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let exit = match exit {
            Ok(exit) => exit,
            Err(err) => {
                // An unreapable child would leave the job stuck in Running
                // forever; better to go down loudly.
                error!(%job_id, error = %err, "failed to await child");
                std::process::abort();
            }
        };

        // Let the pipe pumps drain whatever the child wrote before closing
        // the buffer, or late output would be lost.
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }

        let status = final_status(exit);
        *job.status.write().unwrap() = status;
        job.output.close();
        job.terminated.cancel();
        match status.code {
            StatusCode::Stopped => info!(%job_id, "job stopped"),
            _ => info!(%job_id, "job complete"),
        }
    });
}

fn final_status(exit: ExitStatus) -> Status {
    // The exit code is -1 when the child died from a signal.
    let exit_code = exit.code().unwrap_or(-1);
    if exit.signal() == Some(SIGKILL) {
        Status {
            code: StatusCode::Stopped,
            exit_code,
        }
    } else {
        Status {
            code: StatusCode::Completed,
            exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Writes an executable shell script into a scratch dir and returns the
    /// dir (which must outlive the job) together with the script path.
    fn script(body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-command.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[tokio::test]
    async fn submitted_command_completes_with_logs() {
        let worker = Worker::new();
        let job_id = worker.submit("echo hello world").unwrap();

        sleep(Duration::from_millis(500)).await;

        let status = worker.status(job_id).unwrap();
        assert_eq!(status.code, StatusCode::Completed);
        assert_eq!(status.exit_code, 0);

        let mut reader = worker.logs(job_id, CancellationToken::new()).unwrap();
        let output = reader.read_to_end().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output), "hello world\n");
    }

    #[tokio::test]
    async fn stopped_job_reports_stopped_status() {
        let worker = Worker::new();
        let job_id = worker.submit("sleep 30").unwrap();

        let status = worker.status(job_id).unwrap();
        assert_eq!(status.code, StatusCode::Running);
        assert_eq!(status.exit_code, 0);

        worker.stop(job_id).await.unwrap();

        // No grace period: a successful stop guarantees the final status.
        let status = worker.status(job_id).unwrap();
        assert_eq!(status.code, StatusCode::Stopped);
        assert_eq!(status.exit_code, -1);
    }

    #[tokio::test]
    async fn stopping_twice_fails() {
        let worker = Worker::new();
        let job_id = worker.submit("sleep 30").unwrap();
        worker.stop(job_id).await.unwrap();
        assert!(matches!(worker.stop(job_id).await, Err(Error::StopFailed)));
    }

    #[tokio::test]
    async fn stopping_a_finished_job_fails() {
        let worker = Worker::new();
        let job_id = worker.submit("true").unwrap();
        sleep(Duration::from_millis(500)).await;
        assert!(matches!(worker.stop(job_id).await, Err(Error::StopFailed)));
    }

    #[tokio::test]
    async fn late_reader_sees_full_output() {
        let worker = Worker::new();
        let job_id = worker.submit("echo all done").unwrap();
        sleep(Duration::from_millis(500)).await;

        let mut reader = worker.logs(job_id, CancellationToken::new()).unwrap();
        let output = reader.read_to_end().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output), "all done\n");
    }

    #[tokio::test]
    async fn stderr_is_interleaved_into_the_log() {
        let worker = Worker::new();
        let (_dir, path) = script("echo to stdout\necho to stderr >&2");
        let job_id = worker.submit(&path).unwrap();
        sleep(Duration::from_millis(500)).await;

        let mut reader = worker.logs(job_id, CancellationToken::new()).unwrap();
        let output = reader.read_to_end().await.unwrap();
        let output = String::from_utf8_lossy(&output);
        assert!(output.contains("to stdout\n"));
        assert!(output.contains("to stderr\n"));
    }

    #[tokio::test]
    async fn concurrent_readers_see_identical_output() {
        let worker = Worker::new();
        let (_dir, path) = script("for i in 1 2 3; do\n  echo line $i\n  sleep 1\ndone");
        let job_id = worker.submit(&path).unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut reader = worker.logs(job_id, CancellationToken::new()).unwrap();
            handles.push(tokio::spawn(
                async move { reader.read_to_end().await.unwrap() },
            ));
        }
        for handle in handles {
            let output = handle.await.unwrap();
            assert_eq!(String::from_utf8_lossy(&output), "line 1\nline 2\nline 3\n");
        }
    }

    #[tokio::test]
    async fn reader_cancellation_interrupts_a_blocked_read() {
        let worker = Worker::new();
        let job_id = worker.submit("sleep 5").unwrap();

        let cancel = CancellationToken::new();
        let mut reader = worker.logs(job_id, cancel.clone()).unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let mut out = [0u8; 64];
        assert!(reader.read(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let worker = Worker::new();
        assert!(matches!(worker.submit("   "), Err(Error::EmptyCommand)));
    }

    #[tokio::test]
    async fn unknown_program_fails_to_spawn() {
        let worker = Worker::new();
        assert!(matches!(
            worker.submit("no-such-binary-anywhere"),
            Err(Error::SpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let worker = Worker::new();
        let job_id = Uuid::new_v4();
        assert!(matches!(worker.status(job_id), Err(Error::NotFound)));
        assert!(matches!(worker.stop(job_id).await, Err(Error::NotFound)));
        assert!(matches!(
            worker.logs(job_id, CancellationToken::new()),
            Err(Error::NotFound)
        ));
    }
}
