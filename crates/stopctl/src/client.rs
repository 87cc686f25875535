//! Control client.
//!
//! Dials the rendezvous socket path directly; there is no network address
//! resolution involved.

use std::io;
use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::error::{ClientError, ProtocolError};
use crate::proto::{self, Empty, Method, Request, Response};

/// A connection to a control server.
///
/// The connection is owned by the client and released when it is dropped.
pub struct ControlClient {
    framed: Framed<UnixStream, LinesCodec>,
    next_id: u64,
}

impl ControlClient {
    /// Connect to the control socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connection {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(path = %path.display(), "Connected to control socket");
        Ok(Self {
            framed: proto::framed(stream),
            next_id: 1,
        })
    }

    /// Ask the server to drain and stop. Returns as soon as the server has
    /// accepted the request, long before it has actually stopped.
    pub async fn stop(&mut self) -> Result<Empty, ClientError> {
        self.call(Method::Stop).await
    }

    /// Issue a `Wait`, which blocks on the server for its configured interval.
    pub async fn wait(&mut self) -> Result<Empty, ClientError> {
        self.call(Method::Wait).await
    }

    /// Shut down the write half and release the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match SinkExt::<String>::close(&mut self.framed).await {
            Ok(()) => Ok(()),
            // The server hangs up on its own once a drain starts.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(ProtocolError::from(e).into()),
        }
    }

    async fn call(&mut self, method: Method) -> Result<Empty, ClientError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id,
            method,
            body: Empty {},
        };
        self.framed
            .send(proto::encode(&request)?)
            .await
            .map_err(ProtocolError::from)?;

        let line = self
            .framed
            .next()
            .await
            .ok_or(ProtocolError::Closed)?
            .map_err(ProtocolError::from)?;

        let response = proto::decode_response(&line)?;
        if response.id() != id {
            return Err(ProtocolError::MismatchedResponse {
                expected: id,
                got: response.id(),
            }
            .into());
        }

        match response {
            Response::Ok { body, .. } => Ok(body),
            Response::Error { message, .. } => Err(ClientError::Rpc(message)),
        }
    }
}

/// Connect, issue `Stop`, and disconnect.
pub async fn stop(path: impl AsRef<Path>) -> Result<(), ClientError> {
    let mut client = ControlClient::connect(path).await?;
    client.stop().await?;
    client.close().await
}

/// Connect, issue `Wait`, and disconnect.
pub async fn wait(path: impl AsRef<Path>) -> Result<(), ClientError> {
    let mut client = ControlClient::connect(path).await?;
    client.wait().await?;
    client.close().await
}
