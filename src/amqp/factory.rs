use crate::amqp::configuration::RabbitMqSettings;
use crate::transport::rabbitmq::RabbitMqConnection;
use crate::transport::{ConnectionPrimitive, Connector};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker, except for the host.
///
/// `ConnectionFactory` implements [`Connector`]: it tries each candidate host in order and
/// returns the first connection it manages to establish.
pub struct ConnectionFactory {
    settings: RabbitMqSettings,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    /// If `None`, the host we are connecting to is expected.
    domain_name: Option<String>,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("TLS configuration failed")?;
                Ok(Tls {
                    domain_name: tls_settings.domain.clone(),
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            settings: settings.clone(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS Connector for the connection factory, along with the expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: Option<String>,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Create a new connection to the RabbitMq broker running on `host`.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(
        &self,
        host: &str,
        client_name: &str,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_connection_name(client_name.into());
        let uri = self.settings.amqp_uri(host);
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(uri, properties).await,
                Some(tls) => self.connect_with_tls(uri, properties, Arc::clone(tls)).await,
            }
        })
        .await
        .with_context(|| format!("Timed out while trying to connect to RabbitMQ at {host}."))?
        .with_context(|| format!("Failed to connect to RabbitMQ at {host}."))?;
        Ok(connection)
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(uri, properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        let domain_name = tls_configuration
            .domain_name
            .clone()
            .unwrap_or_else(|| uri.authority.host.clone());
        lapin::Connection::connector(
            uri,
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| tcp.into_native_tls(&tls_configuration.connector, &domain_name))
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    async fn connect(
        &self,
        hosts: &[String],
        client_name: &str,
    ) -> Result<Arc<dyn ConnectionPrimitive>, anyhow::Error> {
        let mut last_error = anyhow::anyhow!("No RabbitMq host was configured.");
        for host in hosts {
            match self.new_connection(host, client_name).await {
                Ok(connection) => {
                    return Ok(Arc::new(RabbitMqConnection::new(
                        connection,
                        self.settings.publisher_confirms,
                    )));
                }
                Err(e) => {
                    warn!(host = %host, "Could not connect to RabbitMq: {:?}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
