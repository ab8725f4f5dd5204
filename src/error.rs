/// Error returned by the channel pools, the connection manager and the topology coordinator.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// None of the candidate hosts accepted a connection.
    ///
    /// It is never retried by this crate: retry policies belong to the caller.
    #[error("Failed to connect to any of the RabbitMq brokers at {hosts:?}")]
    BrokerUnreachable {
        hosts: Vec<String>,
        #[source]
        source: anyhow::Error,
    },
    /// No open channel exists and none can recover.
    #[error("No channel is available: {0}")]
    ChannelAvailability(String),
    /// The caller's cancellation token fired while the request was still pending.
    #[error("The operation was cancelled before it could complete")]
    Cancelled,
    /// A declaration, bind or unbind was rejected.
    #[error("Failed to {operation}")]
    Topology {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
    /// Invalid settings, rejected before any network activity.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// The background worker serving the request has shut down.
    #[error("The {0} has been shut down")]
    ShutDown(&'static str),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.into())
    }
}
