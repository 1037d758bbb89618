use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::Error;
use ferret::{
    ca::Ca,
    forward::Forward,
    record::{
        CapturedRequest,
        RequestSink,
    },
    tls,
    Proxy,
    Replayer,
};
use ferret_store::RequestStore;
use tokio_util::sync::CancellationToken;

use crate::{
    api,
    config::Config,
};

#[derive(Debug, Parser)]
pub struct Args {
    #[clap(flatten)]
    pub options: Options,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(short, long, env = "FERRET_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate the root certificate used for interception.
    Ca,

    /// Run the intercepting proxy.
    Proxy {
        #[clap(short, long)]
        bind_address: Option<SocketAddr>,
    },

    /// Serve the capture history and replay API.
    Repeater {
        #[clap(short, long)]
        bind_address: Option<SocketAddr>,
    },
}

pub struct App {
    config: Config,
}

impl App {
    pub fn new(options: Options) -> Result<Self, Error> {
        let config = Config::open(options.config.as_ref())?;
        Ok(Self { config })
    }

    pub async fn run(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Ca => {
                let ca = Ca::generate().await?;
                let key_file = self.config.path.join(&self.config.data.ca.key_file);
                let cert_file = self.config.path.join(&self.config.data.ca.cert_file);
                ca.save(&key_file, &cert_file)?;
                tracing::info!("Key file saved to: {}", key_file.display());
                tracing::info!("Cert file saved to: {}", cert_file.display());
            }
            Command::Proxy { bind_address } => {
                let ca = Ca::open(
                    self.config.path.join(&self.config.data.ca.key_file),
                    self.config.path.join(&self.config.data.ca.cert_file),
                )?;
                let tls = tls::Context::new(ca).await?;
                let forward = Forward::new()?;
                let store = self.open_store().await?;

                let proxy = Proxy::new(tls, forward, StoreSink { store }).with_idle_timeout(
                    Duration::from_secs(self.config.data.proxy.capture_idle_secs),
                );

                let bind_address = bind_address.unwrap_or(self.config.data.proxy.bind_address);
                proxy
                    .serve(bind_address, cancel_on_ctrlc_or_sigterm())
                    .await?;
            }
            Command::Repeater { bind_address } => {
                let store = self.open_store().await?;
                let replayer = Replayer::new(Forward::new()?);
                let router = api::router(store, replayer);

                let bind_address = bind_address.unwrap_or(self.config.data.repeater.bind_address);
                let listener = tokio::net::TcpListener::bind(bind_address).await?;
                tracing::info!(address = %bind_address, "repeater listening");

                let shutdown = cancel_on_ctrlc_or_sigterm();
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await?;
            }
        }

        Ok(())
    }

    async fn open_store(&self) -> Result<RequestStore, ferret_store::Error> {
        let path = self.config.path.join(&self.config.data.store.database_file);
        RequestStore::create(path).await
    }
}

/// Persists captured requests into the history database.
#[derive(Clone, Debug)]
pub struct StoreSink {
    store: RequestStore,
}

impl RequestSink for StoreSink {
    type Error = ferret_store::Error;

    async fn save(&self, record: CapturedRequest) -> Result<(), Self::Error> {
        self.store.create_request(&record).await?;
        Ok(())
    }
}

fn cancel_on_ctrlc_or_sigterm() -> CancellationToken {
    let token = CancellationToken::new();

    async fn sigterm() {
        #[cfg(unix)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .unwrap()
            .recv()
            .await;

        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    }

    tokio::spawn({
        let token = token.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C. Shutting down.");
                }
                _ = sigterm() => {
                    tracing::info!("Received SIGTERM. Shutting down.");
                }
            }

            token.cancel();
        }
    });

    token
}
