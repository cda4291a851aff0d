mod client;

use clap::{Parser, Subcommand};
use client::WorkerClient;
use uuid::Uuid;

/// Connect to a remote job worker server
#[derive(Debug, Parser)]
#[clap(name = "cli")]
struct Cli {
    /// The address of the server
    #[clap(short = 's', long = "server", default_value = "127.0.0.1:8080")]
    server: String,

    /// Certificate of the CA that signed the server certificate
    #[clap(long, default_value = "./certs/ca.crt")]
    ca_cert: String,

    /// Client certificate presented to the server
    #[clap(long, default_value = "./certs/client_a.crt")]
    client_cert: String,

    /// Private key for the client certificate
    #[clap(long, default_value = "./certs/client_a.key")]
    client_key: String,

    /// The sub-command to issue
    #[clap(subcommand)]
    sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Submit a command line to run as a new job
    Submit { command: Vec<String> },
    /// Stop a running job
    Stop { job_id: Uuid },
    /// Query the status of a job
    Status { job_id: Uuid },
    /// Stream a job's output from the beginning
    Logs { job_id: Uuid },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();
    let mut client = WorkerClient::connect(
        &args.server,
        &args.ca_cert,
        &args.client_cert,
        &args.client_key,
    )
    .await?;

    match args.sub_command {
        SubCommand::Submit { command } => client.submit(&command.join(" ")).await?,
        SubCommand::Stop { job_id } => client.stop(job_id).await?,
        SubCommand::Status { job_id } => client.status(job_id).await?,
        SubCommand::Logs { job_id } => client.logs(job_id).await?,
    }
    Ok(())
}
