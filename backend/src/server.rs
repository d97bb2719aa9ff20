//! Unix socket server for the Jest API
//!
//! Clients exchange length-prefixed JSON frames: one [`Request`] in, one
//! [`crate::api::Response`] out, any number of times per connection.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, instrument, warn};

use crate::api::{ApiError, Request, Response, status};
use crate::handler::handle_request;
use crate::Jest;

/// Largest frame either side may send
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames are a 4-byte big-endian payload length followed by a JSON
/// document of that length
#[derive(Debug, Clone)]
pub struct JsonCodec;

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

impl Decoder for JsonCodec {
    type Item = serde_json::Value;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&[a, b, c, d]) = src.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([a, b, c, d]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(invalid_data(format!("frame of {} bytes exceeds {}", len, MAX_FRAME_LEN)));
        }

        let frame_len = 4 + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(4);
        serde_json::from_slice(&frame).map(Some).map_err(invalid_data)
    }
}

impl Encoder<serde_json::Value> for JsonCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: serde_json::Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item).map_err(invalid_data)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(invalid_data(format!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_LEN)));
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Unix socket server for the Jest API
pub struct SocketServer {
    socket_path: PathBuf,
    jest: Arc<Jest>,
}

impl SocketServer {
    pub fn new(socket_path: impl Into<PathBuf>, jest: Arc<Jest>) -> Self {
        Self {
            socket_path: socket_path.into(),
            jest,
        }
    }

    /// Bind the socket and serve connections until the task is dropped.
    ///
    /// A stale socket file is replaced. The socket is readable and writable
    /// by its owner only.
    #[instrument(skip(self), fields(socket = %self.socket_path.display()))]
    pub async fn run(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            debug!("Removing stale socket file");
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!("Jest API server listening");

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    continue;
                }
            };

            let jest = Arc::clone(&self.jest);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, jest).await {
                    warn!(error = %e, "Connection dropped");
                }
            });
        }
    }
}

/// Answer every frame on `stream` until the client hangs up
async fn serve_connection(stream: UnixStream, jest: Arc<Jest>) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, JsonCodec);

    while let Some(frame) = framed.next().await {
        let response = match serde_json::from_value::<Request>(frame?) {
            Ok(request) => dispatch(request, &jest).await,
            Err(e) => {
                warn!(error = %e, "Invalid request format");
                let message = format!("Invalid request format: {}", e);
                Response::error(status::BAD_REQUEST, ApiError::new("INVALID_REQUEST", message))
            }
        };
        framed.send(serde_json::to_value(&response).map_err(invalid_data)?).await?;
    }

    debug!("Connection closed by client");
    Ok(())
}

async fn dispatch(request: Request, jest: &Arc<Jest>) -> Response {
    info!(method = ?request.method, endpoint = %request.endpoint, "Incoming request");

    let response = handle_request(request, Arc::clone(jest)).await;
    if response.is_success() {
        debug!(status = response.status, "Request successful");
    } else {
        warn!(status = response.status, error = %response.message, "Request failed");
    }
    response
}
