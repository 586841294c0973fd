//! Terraform Provider for Harvester
//!
//! This binary is launched by Terraform through go-plugin. It serves the
//! Terraform Plugin Protocol v6 over gRPC on a local port announced on stdout.

use std::env;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harvester_provider::health::health_server::HealthServer;
use harvester_provider::plugin::{
    handshake_line, ControllerService, HealthService, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
};
use harvester_provider::plugin_proto::grpc_controller_server::GrpcControllerServer;
use harvester_provider::provider::HarvesterProvider;
use harvester_provider::tfplugin6::provider_server::ProviderServer;
use harvester_provider::tls::ServerCertificate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // go-plugin forwards stderr lines into Terraform's log
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HARVESTER_PROVIDER_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    if env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        eprintln!(
            "This binary is a plugin. These are not meant to be executed directly.\n\
             Please execute the program that consumes these plugins, which will\n\
             load any plugins automatically"
        );
        std::process::exit(1);
    }

    info!(
        "Starting Harvester Terraform Provider {}",
        harvester_common::VERSION
    );

    // Find an available port
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut builder = Server::builder();
    let mut server_cert = None;

    if let Ok(client_cert) = env::var("PLUGIN_CLIENT_CERT") {
        let cert = ServerCertificate::generate()?;
        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(&cert.cert_pem, &cert.key_pem))
            .client_ca_root(Certificate::from_pem(client_cert));
        builder = builder.tls_config(tls)?;
        server_cert = Some(cert.handshake_encoding());
    }

    // Output the handshake to stdout as go-plugin expects
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", handshake_line(&addr, server_cert.as_deref()))?;
    stdout.flush()?;

    info!("Provider listening on {}", addr);

    let shutdown = Arc::new(Notify::new());
    let stop = shutdown.clone();

    let result = builder
        .add_service(ProviderServer::new(HarvesterProvider::new()))
        .add_service(HealthServer::new(HealthService))
        .add_service(GrpcControllerServer::new(ControllerService::new(shutdown)))
        .serve_with_shutdown(addr, async move { stop.notified().await })
        .await;

    if let Err(e) = &result {
        error!("gRPC server failed: {}", e);
    }
    result?;

    info!("Provider stopped");
    Ok(())
}
