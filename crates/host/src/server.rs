//! IPC server: accept clients on the per-user endpoint, dispatch each
//! request to the router, write one response.
//!
//! Windows binds a named pipe with an explicit security descriptor; other
//! platforms bind a unix-domain socket under the same name so the protocol
//! and the accept loop run on every CI host. Per-client handling is
//! concurrent and never suspends the accept loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use mytx_common::{TmuxRequest, TmuxResponse};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::router::{execute_router_request, Router};

/// One bound endpoint plus its background runtime.
pub struct PipeServer {
    endpoint: String,
    router: Arc<dyn Router>,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    runtime: tokio::runtime::Runtime,
}

impl PipeServer {
    pub fn new(endpoint: impl Into<String>, router: Arc<dyn Router>) -> Self {
        Self {
            endpoint: endpoint.into(),
            router,
            running: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Bind the endpoint and start accepting in the background. Binding
    /// happens synchronously so address errors surface here.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            anyhow::bail!("server already started on {}", self.endpoint);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("building server runtime")?;

        let listener = runtime
            .block_on(transport::bind(&self.endpoint))
            .with_context(|| format!("binding {}", self.endpoint))?;

        let cancel = CancellationToken::new();
        runtime.spawn(accept_loop(
            listener,
            self.router.clone(),
            self.endpoint.clone(),
            cancel.clone(),
        ));

        *running = Some(Running { cancel, runtime });
        Ok(())
    }

    /// Stop accepting and drain client tasks. Idempotent: calls after a
    /// successful stop (or before start) return `Ok`.
    pub fn stop(&self) -> Result<()> {
        let taken = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.take()
        };
        if let Some(Running { cancel, runtime }) = taken {
            cancel.cancel();
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
        Ok(())
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn accept_loop(
    listener: transport::Listener,
    router: Arc<dyn Router>,
    endpoint: String,
    cancel: CancellationToken,
) {
    tracing::info!(endpoint = %endpoint, "tmux host listening");
    let mut clients: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(endpoint = %endpoint, "tmux host shutting down");
                break;
            }
            Some(finished) = clients.join_next() => {
                if let Err(join_err) = finished {
                    tracing::warn!("client task panicked: {join_err}");
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        let router = router.clone();
                        clients.spawn(async move { handle_client(stream, router).await });
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }

    while let Some(finished) = clients.join_next().await {
        if let Err(join_err) = finished {
            tracing::warn!("client task panicked: {join_err}");
        }
    }
}

/// Read one request, dispatch, write one response, close. Any per-client
/// failure is logged and contained; the accept loop never sees it.
async fn handle_client<S>(stream: S, router: Arc<dyn Router>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => {
            tracing::debug!("client closed before sending a request");
            return;
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(error = %err, "request read failed");
            return;
        }
    }

    let response = match serde_json::from_str::<TmuxRequest>(line.trim()) {
        Ok(request) => {
            tracing::debug!(command = %request.command, caller_pane = %request.caller_pane, "dispatching");
            execute_router_request(router.as_ref(), &request)
        }
        Err(err) => {
            tracing::warn!(error = %err, "malformed request");
            TmuxResponse::error(1, format!("malformed request: {err}"))
        }
    };

    match serde_json::to_vec(&response) {
        Ok(mut payload) => {
            payload.push(b'\n');
            if let Err(err) = writer.write_all(&payload).await {
                tracing::warn!(error = %err, "response write failed");
                return;
            }
            let _ = writer.flush().await;
        }
        Err(err) => tracing::warn!(error = %err, "response serialization failed"),
    }
    let _ = writer.shutdown().await;
}

#[cfg(windows)]
mod transport {
    //! Named-pipe listener with an explicit security descriptor granting
    //! access to the system, administrators and the interactive user.

    use std::ffi::c_void;
    use std::io;

    use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{LocalFree, BOOL, HLOCAL};
    use windows::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{
        GetSecurityDescriptorLength, PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES,
    };

    const SECURITY_DESCRIPTOR: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)(A;;GA;;;IU)";
    const ERROR_PIPE_CONNECTED: i32 = 535;

    pub struct Listener {
        path: String,
    }

    pub async fn bind(endpoint: &str) -> io::Result<Listener> {
        let listener = Listener {
            path: endpoint.to_string(),
        };
        // create the first instance eagerly so bind errors surface at start
        drop(listener.create_instance()?);
        Ok(listener)
    }

    impl Listener {
        fn create_instance(&self) -> io::Result<NamedPipeServer> {
            let mut descriptor = security_descriptor_blob()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            let mut attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor.as_mut_ptr() as *mut c_void,
                bInheritHandle: BOOL::from(false),
            };
            let attrs_ptr: *mut c_void =
                (&mut attributes) as *mut SECURITY_ATTRIBUTES as *mut c_void;

            unsafe {
                ServerOptions::new()
                    .pipe_mode(PipeMode::Byte)
                    .max_instances(64)
                    .create_with_security_attributes_raw(&self.path, attrs_ptr)
            }
        }

        pub async fn accept(&self) -> io::Result<NamedPipeServer> {
            let server = self.create_instance()?;
            match server.connect().await {
                Ok(()) => Ok(server),
                Err(err) if err.raw_os_error() == Some(ERROR_PIPE_CONNECTED) => Ok(server),
                Err(err) => Err(err),
            }
        }
    }

    fn security_descriptor_blob() -> anyhow::Result<Vec<u8>> {
        let mut wide: Vec<u16> = SECURITY_DESCRIPTOR.encode_utf16().collect();
        wide.push(0);

        let mut raw = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(wide.as_ptr()),
                SDDL_REVISION_1,
                &mut raw,
                None,
            )?;

            let length = GetSecurityDescriptorLength(raw) as usize;
            let slice = std::slice::from_raw_parts(raw.0 as *const u8, length);
            let blob = slice.to_vec();
            let _ = LocalFree(HLOCAL(raw.0));
            Ok(blob)
        }
    }
}

#[cfg(not(windows))]
mod transport {
    //! Unix-domain-socket stand-in carrying the same per-user name.

    use std::io;
    use std::path::Path;

    use tokio::net::{UnixListener, UnixStream};

    pub struct Listener {
        inner: UnixListener,
    }

    pub async fn bind(endpoint: &str) -> io::Result<Listener> {
        let path = Path::new(endpoint);
        if path.exists() {
            // a previous host left its socket behind
            std::fs::remove_file(path)?;
        }
        Ok(Listener {
            inner: UnixListener::bind(path)?,
        })
    }

    impl Listener {
        pub async fn accept(&self) -> io::Result<UnixStream> {
            self.inner.accept().await.map(|(stream, _)| stream)
        }
    }
}
