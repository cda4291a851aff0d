use std::io::Write;

use protobuf::status_response::StatusType;
use protobuf::worker_service_client::WorkerServiceClient;
use protobuf::{Command, JobId};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{Request, Status};
use uuid::Uuid;

pub struct WorkerClient {
    inner: WorkerServiceClient<Channel>,
}

impl WorkerClient {
    pub async fn connect(
        server_addr: &str,
        ca_cert_file: &str,
        client_cert_file: &str,
        client_key_file: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let ca_cert = Certificate::from_pem(tokio::fs::read(ca_cert_file).await?);
        let identity = Identity::from_pem(
            tokio::fs::read(client_cert_file).await?,
            tokio::fs::read(client_key_file).await?,
        );
        let tls = ClientTlsConfig::new()
            .domain_name("localhost")
            .ca_certificate(ca_cert)
            .identity(identity);

        let channel = Channel::from_shared(format!("https://{}", server_addr))?
            .tls_config(tls)?
            .connect()
            .await?;
        Ok(Self {
            inner: WorkerServiceClient::new(channel),
        })
    }

    pub async fn submit(&mut self, command: &str) -> Result<(), Status> {
        let response = self
            .inner
            .submit(Request::new(Command {
                command: command.into(),
            }))
            .await?;
        println!("Id of submitted job: {}", response.into_inner().id);
        Ok(())
    }

    pub async fn stop(&mut self, job_id: Uuid) -> Result<(), Status> {
        self.inner
            .stop(Request::new(JobId {
                id: job_id.to_string(),
            }))
            .await?;
        println!("Stopped job: {}", job_id);
        Ok(())
    }

    pub async fn status(&mut self, job_id: Uuid) -> Result<(), Status> {
        let response = self
            .inner
            .status(Request::new(JobId {
                id: job_id.to_string(),
            }))
            .await?
            .into_inner();
        match StatusType::from_i32(response.status) {
            Some(StatusType::Running) => println!("Running"),
            Some(StatusType::Completed) => {
                println!("Completed with exit code: {}", response.exit_code)
            }
            Some(StatusType::Stopped) => {
                println!("Stopped with exit code: {}", response.exit_code)
            }
            None => println!("Unknown status: {}", response.status),
        }
        Ok(())
    }

    /// Streams the job's log lines to stdout, reinserting the newlines the
    /// server stripped.
    pub async fn logs(&mut self, job_id: Uuid) -> Result<(), Status> {
        let mut stream = self
            .inner
            .get_logs(Request::new(JobId {
                id: job_id.to_string(),
            }))
            .await?
            .into_inner();
        let mut stdout = std::io::stdout();
        while let Some(log) = stream.message().await? {
            if let Err(err) = writeln!(stdout, "{}", log.log_line) {
                if err.kind() == std::io::ErrorKind::BrokenPipe {
                    break;
                }
                let _ = writeln!(std::io::stderr(), "{}", err);
            }
        }
        Ok(())
    }
}
