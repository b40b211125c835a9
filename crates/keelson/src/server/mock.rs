//! In-memory transport for exercising a fully assembled server in tests.

use crate::Result;
use hyper_util::rt::TokioIo;
use std::io;
use tokio::{
    io::DuplexStream,
    sync::mpsc,
};
use tonic::transport::{Channel, Endpoint, Uri};

/// Size of each in-memory pipe, in each direction.
pub(crate) const MOCK_BUFFER_SIZE: usize = 1024 * 1024;

/// Connections waiting to be accepted by the mock server.
pub(crate) const MOCK_BACKLOG: usize = 16;

pub(crate) type Incoming = io::Result<DuplexStream>;

/// Dial side of a server started with [`Server::run_mock`].
///
/// Cloning is cheap; every clone feeds the same server. The server keeps
/// running for as long as one clone (or a channel built from one) is alive.
///
/// [`Server::run_mock`]: crate::Server::run_mock
#[derive(Clone, Debug)]
pub struct MockTransport {
    incoming: mpsc::Sender<Incoming>,
}

impl MockTransport {
    pub(crate) fn new(incoming: mpsc::Sender<Incoming>) -> Self {
        Self { incoming }
    }

    /// Opens one raw connection to the server.
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(MOCK_BUFFER_SIZE);
        self.incoming.send(Ok(server)).await.map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "mock server has stopped")
        })?;
        Ok(client)
    }

    /// Builds a tonic channel whose connections are all dialled in memory.
    pub async fn channel(&self) -> Result<Channel> {
        let transport = self.clone();
        let channel = Endpoint::from_static("http://keelson.mock")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let transport = transport.clone();
                async move { transport.dial().await.map(TokioIo::new) }
            }))
            .await?;
        Ok(channel)
    }
}
