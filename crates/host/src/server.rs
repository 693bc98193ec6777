use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use micro_host_core::{Application, Interceptor, Phase, PhaseError, Pipeline};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::config::HostConfig;
use crate::dispatcher::Http1Connection;
use crate::host_pipeline::HostPipelineBuilder;

#[derive(Debug)]
pub struct ServerBuilder {
    application: Option<Application>,
    address: Option<Vec<SocketAddr>>,
    config: HostConfig,
    host_pipeline: HostPipelineBuilder,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { application: None, address: None, config: HostConfig::default(), host_pipeline: HostPipelineBuilder::new() }
    }

    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Result<Self, ServerBuildError> {
        let address = address.to_socket_addrs().map_err(ServerBuildError::InvalidAddress)?.collect::<Vec<_>>();
        self.address = Some(address);
        Ok(self)
    }

    pub fn application(mut self, application: Application) -> Self {
        self.application = Some(application);
        self
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a host-level interceptor, run for every call before the
    /// application when `phase` comes before `Infrastructure`.
    pub fn intercept(mut self, phase: &Phase, interceptor: impl Interceptor + 'static) -> Result<Self, ServerBuildError> {
        self.host_pipeline = self.host_pipeline.intercept(phase, interceptor)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let application = self.application.ok_or(ServerBuildError::MissingApplication)?;
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?;

        let host_pipeline = if self.config.send_date { self.host_pipeline.send_date() } else { self.host_pipeline };
        Ok(Server {
            application: Arc::new(application),
            host_pipeline: Arc::new(host_pipeline.build()),
            address,
            config: Arc::new(self.config),
        })
    }
}

#[derive(Debug)]
pub struct Server {
    application: Arc<Application>,
    host_pipeline: Arc<Pipeline>,
    address: Vec<SocketAddr>,
    config: Arc<HostConfig>,
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("application must be set")]
    MissingApplication,
    #[error("address must be set")]
    MissingAddress,
    #[error("invalid address: {0}")]
    InvalidAddress(#[source] std::io::Error),
    #[error("invalid host pipeline: {0}")]
    Pipeline(#[from] PhaseError),
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    /// Accepts HTTP/1.1 connections until ctrl-c, then disposes the
    /// application.
    pub async fn start(self) {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            warn!("a global tracing subscriber is already installed");
        }

        info!("start listening at {:?}", self.address);
        let tcp_listener = match TcpListener::bind(self.address.as_slice()).await {
            Ok(tcp_listener) => tcp_listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };

        tokio::select! {
            () = self.accept_loop(tcp_listener) => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(cause = %e, "failed to listen for shutdown signal");
                }
                info!("shutting down");
            }
        }

        self.application.dispose();
    }

    async fn accept_loop(&self, tcp_listener: TcpListener) {
        loop {
            let (tcp_stream, remote_addr) = match tcp_listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };

            let application = Arc::clone(&self.application);
            let host_pipeline = Arc::clone(&self.host_pipeline);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                let (reader, writer) = tcp_stream.into_split();
                let connection = Http1Connection::new(reader, writer, config).with_remote_addr(remote_addr);
                match connection.process(application, host_pipeline).await {
                    Ok(()) => {
                        info!(%remote_addr, "finished process, connection shutdown");
                    }
                    Err(e) => {
                        error!(%remote_addr, cause = %e, "service has error, connection shutdown");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_application_and_address() {
        let missing_application = Server::builder().address("127.0.0.1:8080").unwrap().build();
        assert!(matches!(missing_application, Err(ServerBuildError::MissingApplication)));

        let missing_address = Server::builder().application(Application::new(Pipeline::application())).build();
        assert!(matches!(missing_address, Err(ServerBuildError::MissingAddress)));
    }

    #[test]
    fn host_interceptor_needs_a_known_phase() {
        let result = Server::builder().intercept(&Phase::new("Nowhere"), crate::host_pipeline::EnterApplication);
        assert!(matches!(result, Err(ServerBuildError::Pipeline(PhaseError::Unknown { .. }))));
    }
}
