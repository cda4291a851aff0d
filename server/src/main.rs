mod interceptors;
mod services;

use std::collections::HashMap;

use clap::{Parser, Subcommand};
pub use interceptors::cert::PrincipalExtension;
use interceptors::cert;
use protobuf::worker_service_server::WorkerServiceServer;
use services::workerservice::WorkerApiService;
use tokio_rustls::rustls::{
    self, ciphersuite::TLS13_AES_256_GCM_SHA384, AllowAnyAuthenticatedClient, RootCertStore,
    ServerConfig,
};
use tonic::transport::{Server, ServerTlsConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;
use worklib::isolation::{run_isolated, CGroups};
use worklib::Worker;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Remote job worker service
#[derive(Debug, Parser)]
#[clap(name = "server")]
struct Args {
    /// Certificate of the CA that signs client certificates
    #[clap(long, default_value = "./certs/ca.crt")]
    ca_cert: String,

    /// Certificate presented to clients
    #[clap(long, default_value = "./certs/server.crt")]
    server_cert: String,

    /// Private key for the server certificate
    #[clap(long, default_value = "./certs/server.key")]
    server_key: String,

    /// host:port to listen on
    #[clap(long, default_value = "127.0.0.1:8080")]
    address: String,

    /// Create the configured cgroups at startup and confine every job to
    /// them (requires root)
    #[clap(long)]
    cgroups: bool,

    #[clap(subcommand)]
    command: Option<SubCommand>,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Run a single command inside the container image and exit.
    ///
    /// This is the re-exec entry point that applies filesystem isolation in
    /// the child before the command runs.
    Exec { command: String },
}

/// Configuration required by the server.
pub struct Config {
    pub ca_cert_file: String,
    pub server_cert_file: String,
    pub server_key_file: String,
    pub address: String,
    pub cgroups: Option<CGroups>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Some(SubCommand::Exec { command }) = args.command {
        let code = run_isolated(&command)?;
        std::process::exit(code);
    }

    let config = Config {
        ca_cert_file: args.ca_cert,
        server_cert_file: args.server_cert,
        server_key_file: args.server_key,
        address: args.address,
        cgroups: args.cgroups.then(default_cgroups),
    };

    info!(pid = std::process::id(), "starting server");
    serve(config).await
}

/// Cgroup limits applied to every job when `--cgroups` is set.
fn default_cgroups() -> CGroups {
    let mut limits = HashMap::new();
    limits.insert(
        "cpu".to_string(),
        HashMap::from([
            ("shares".to_string(), "100".to_string()),
            ("cfs_quota_us".to_string(), "1000".to_string()),
            ("cfs_period_us".to_string(), "1000".to_string()),
        ]),
    );
    limits.insert(
        "memory".to_string(),
        HashMap::from([("limit_in_bytes".to_string(), "1000g".to_string())]),
    );
    CGroups { limits }
}

async fn serve(config: Config) -> Result<(), BoxError> {
    let addr: std::net::SocketAddr = config.address.parse()?;

    // load the CA used to verify client certificates
    let ca_pem = tokio::fs::read(&config.ca_cert_file).await?;
    let mut client_roots = RootCertStore::empty();
    let ca_ders = rustls_pemfile::certs(&mut ca_pem.as_slice())
        .map_err(|err| format!("cannot parse CA cert file: {:?}", err))?;
    for der in ca_ders {
        client_roots
            .add(&rustls::Certificate(der))
            .map_err(|err| format!("error reading CA cert: {:?}", err))?;
    }
    let client_auth = AllowAnyAuthenticatedClient::new(client_roots);
    let cipher_suites = &[&TLS13_AES_256_GCM_SHA384];
    let mut rustls_config = ServerConfig::with_ciphersuites(client_auth, cipher_suites);

    // load the server certificate chain
    let cert_pem = tokio::fs::read(&config.server_cert_file).await?;
    let server_cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .map_err(|err| format!("cannot parse server cert file: {:?}", err))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    // load the server key
    let key_pem = tokio::fs::read(&config.server_key_file).await?;
    let server_key = match rustls_pemfile::read_one(&mut key_pem.as_slice())
        .map_err(|err| format!("cannot parse server private key file: {:?}", err))?
    {
        Some(rustls_pemfile::Item::ECKey(key)) => rustls::PrivateKey(key),
        Some(rustls_pemfile::Item::PKCS8Key(key)) => rustls::PrivateKey(key),
        Some(rustls_pemfile::Item::RSAKey(key)) => rustls::PrivateKey(key),
        _ => return Err("no usable private key in server key file".into()),
    };
    rustls_config.set_single_cert(server_cert_chain, server_key)?;

    // HTTP/2 over tls
    rustls_config.set_protocols(&[b"h2".to_vec()]);

    let tls_config = ServerTlsConfig::new()
        .rustls_server_config(rustls_config)
        .to_owned();

    let worker = match config.cgroups {
        Some(cgroups) => {
            cgroups.setup()?;
            Worker::with_cgroups(cgroups)
        }
        None => Worker::new(),
    };
    let service = WorkerApiService::new(worker);
    let worker_server = WorkerServiceServer::with_interceptor(service, cert::extract_principal);
    info!(%addr, "listening");

    Server::builder()
        .tls_config(tls_config)?
        .add_service(worker_server)
        .serve(addr)
        .await?;

    Ok(())
}
