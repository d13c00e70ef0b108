//! One-shot IPC client: connect, send one request, read one response.
//!
//! Connection failures get their own error class so the caller can print a
//! "no server running" diagnostic instead of a raw OS error. The client
//! spins up its own current-thread runtime; the shim is otherwise fully
//! synchronous.

use std::io;
use std::time::Duration;

use mytx_common::{TmuxRequest, TmuxResponse};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IpcError {
    /// Nothing is listening on the endpoint (or it refused within the
    /// connect timeout).
    #[error("no server running on {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("ipc i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("ipc payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("server closed the connection without a response")]
    EmptyResponse,
}

/// True for failures where no server accepted the connection.
pub fn is_connection_error(err: &IpcError) -> bool {
    matches!(err, IpcError::Connect { .. })
}

/// Send one request and wait for the response.
pub fn send(endpoint: &str, request: &TmuxRequest) -> Result<TmuxResponse, IpcError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(send_async(endpoint, request))
}

async fn send_async(endpoint: &str, request: &TmuxRequest) -> Result<TmuxResponse, IpcError> {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect(endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(IpcError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(IpcError::Connect {
                endpoint: endpoint.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };

    let (reader, mut writer) = tokio::io::split(stream);

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n'); // the newline is the end-of-request signal
    writer.write_all(&payload).await?;
    writer.flush().await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    let line = line.trim();
    if line.is_empty() {
        return Err(IpcError::EmptyResponse);
    }
    Ok(serde_json::from_str(line)?)
}

#[cfg(windows)]
async fn connect(endpoint: &str) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    loop {
        match ClientOptions::new().open(endpoint) {
            Ok(client) => return Ok(client),
            // all instances busy: wait for the server to free one
            Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(not(windows))]
async fn connect(endpoint: &str) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(endpoint).await
}
