//! Stream delivery over a persistent TCP connection, optionally TLS

use crate::errors::{Result, SinkError};
use crate::transport::{DeliveryClient, RetryPolicy};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, error, info, trace};

/// Separates the API key from the document on each line.
const WHITESPACE: &str = " ";

/// Terminates each document.
const MESSAGE_DELIMITER: &str = "\n";

/// Build the wire payload: one `<api key> <document>\n` line per document.
pub fn build_payload(api_key: &str, documents: &[String]) -> String {
    let capacity = documents
        .iter()
        .map(|doc| api_key.len() + doc.len() + 2)
        .sum();
    let mut payload = String::with_capacity(capacity);

    for doc in documents {
        payload.push_str(api_key);
        payload.push_str(WHITESPACE);
        payload.push_str(doc);
        payload.push_str(MESSAGE_DELIMITER);
    }

    payload
}

/// Established connection to the intake.
enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    /// Write the whole buffer and push it onto the wire.
    async fn write_payload(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
            Connection::Tls(stream) => {
                stream.write_all(buf).await?;
                stream.flush().await
            }
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush().await,
            Connection::Tls(stream) => stream.flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.shutdown().await,
            Connection::Tls(stream) => stream.shutdown().await,
        }
    }
}

#[derive(Default)]
struct State {
    connection: Option<Connection>,
    tls: Option<TlsConnector>,
}

impl State {
    async fn discard_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.shutdown().await {
                debug!("Shutdown of failed connection errored: {}", e);
            }
        }
    }
}

/// Delivery client writing newline-delimited documents to a TCP intake.
///
/// The connection is opened lazily and kept across batches. It is dropped
/// after a failed write and re-established on the next attempt. Concurrent
/// `send` calls are serialized.
pub struct TcpTransport {
    host: String,
    port: u16,
    use_ssl: bool,
    api_key: String,
    retry: RetryPolicy,
    state: Mutex<State>,
}

impl TcpTransport {
    pub fn new(
        host: String,
        port: u16,
        use_ssl: bool,
        api_key: String,
        retry: RetryPolicy,
    ) -> Self {
        info!(
            "Creating TCP client with config: URL: {}, Port: {}, UseSSL: {}",
            host, port, use_ssl
        );

        Self {
            host,
            port,
            use_ssl,
            api_key,
            retry,
            state: Mutex::new(State::default()),
        }
    }

    /// Use a custom TLS client configuration instead of the platform roots.
    pub fn with_tls_config(self, config: Arc<ClientConfig>) -> Self {
        Self {
            state: Mutex::new(State {
                connection: None,
                tls: Some(TlsConnector::from(config)),
            }),
            ..self
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    async fn connect(&self, tls: &mut Option<TlsConnector>) -> Result<Connection> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| SinkError::Connect(format!("{}:{}: {}", self.host, self.port, e)))?;

        if !self.use_ssl {
            debug!("Connected to {}:{}", self.host, self.port);
            return Ok(Connection::Plain(stream));
        }

        let connector = match tls {
            Some(connector) => connector.clone(),
            None => tls.insert(native_tls_connector()?).clone(),
        };

        let domain = ServerName::try_from(self.host.clone())
            .map_err(|e| SinkError::Tls(format!("invalid server name {}: {}", self.host, e)))?;

        let stream = connector
            .connect(domain, stream)
            .await
            .map_err(|e| SinkError::Tls(format!("handshake with {} failed: {}", self.host, e)))?;

        debug!("Connected to {}:{} over TLS", self.host, self.port);
        Ok(Connection::Tls(Box::new(stream)))
    }
}

fn native_tls_connector() -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| SinkError::Tls(format!("failed to load native certificates: {}", e)))?;
    for cert in certs {
        let _ = root_store.add(cert);
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[async_trait]
impl DeliveryClient for TcpTransport {
    async fn send(&self, documents: &[String]) -> Result<()> {
        let payload = build_payload(&self.api_key, documents);
        let mut state = self.state.lock().await;
        let state = &mut *state;

        for retry in 0..self.retry.max_retries {
            self.retry.wait(retry).await;

            if state.connection.is_none() {
                match self.connect(&mut state.tls).await {
                    Ok(connection) => state.connection = Some(connection),
                    Err(e) => {
                        error!("Could not connect to Datadog: {}", e);
                        continue;
                    }
                }
            }

            let Some(connection) = state.connection.as_mut() else {
                continue;
            };

            trace!("Sending payload to Datadog: {}", payload);
            match connection.write_payload(payload.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    state.discard_connection().await;
                    error!("Could not send data to Datadog: {}", e);
                }
            }
        }

        error!("Could not send payload to Datadog: {}", payload);
        Err(SinkError::RetriesExhausted {
            attempts: self.retry.max_retries,
        })
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut connection) = state.connection.take() {
            if let Err(e) = connection.flush().await {
                error!("Could not flush the remaining data: {}", e);
            }
            if let Err(e) = connection.shutdown().await {
                debug!("Connection shutdown errored: {}", e);
            }
        }
    }
}
