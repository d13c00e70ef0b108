//! End-to-end exercise of the IPC server over the local transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mytx_common::{TmuxRequest, TmuxResponse};
use mytx_host::{PipeServer, Router};

struct CountingRouter {
    handled: AtomicUsize,
}

impl Router for CountingRouter {
    fn handle(&self, request: &TmuxRequest) -> TmuxResponse {
        self.handled.fetch_add(1, Ordering::SeqCst);
        match request.command.as_str() {
            "has-session" => TmuxResponse::ok(format!("seen {}", request.flag_str("-t").unwrap_or(""))),
            other => TmuxResponse::error(3, format!("unhandled command {other}")),
        }
    }
}

fn test_endpoint(tag: &str) -> String {
    if cfg!(windows) {
        format!(r"\\.\pipe\mytx-host-test-{tag}-{}", std::process::id())
    } else {
        std::env::temp_dir()
            .join(format!("mytx-host-test-{tag}-{}.sock", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }
}

/// Blocking one-shot client mirroring the shim's wire protocol.
fn roundtrip(endpoint: &str, request: &TmuxRequest) -> TmuxResponse {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(endpoint)
            .unwrap();
        #[cfg(not(windows))]
        let stream = tokio::net::UnixStream::connect(endpoint).await.unwrap();

        let (reader, mut writer) = tokio::io::split(stream);
        let mut payload = serde_json::to_vec(request).unwrap();
        payload.push(b'\n');
        writer.write_all(&payload).await.unwrap();
        writer.flush().await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    })
}

fn wait_for_server(endpoint: &str) {
    // the accept loop spawns right after bind; give it a moment on slow CI
    for _ in 0..50 {
        #[cfg(not(windows))]
        if std::path::Path::new(endpoint).exists() {
            return;
        }
        #[cfg(windows)]
        {
            let _ = endpoint;
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

#[test]
fn serves_sequential_clients() {
    let endpoint = test_endpoint("seq");
    let router = Arc::new(CountingRouter {
        handled: AtomicUsize::new(0),
    });
    let server = PipeServer::new(endpoint.clone(), router.clone());
    server.start().unwrap();
    wait_for_server(&endpoint);

    let mut request = TmuxRequest::new("has-session");
    request
        .flags
        .insert("-t".into(), mytx_common::FlagValue::Str("demo".into()));

    for _ in 0..3 {
        let response = roundtrip(&endpoint, &request);
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.stdout, "seen demo");
    }
    assert_eq!(router.handled.load(Ordering::SeqCst), 3);

    server.stop().unwrap();
}

#[test]
fn router_errors_propagate_in_the_response() {
    let endpoint = test_endpoint("err");
    let router = Arc::new(CountingRouter {
        handled: AtomicUsize::new(0),
    });
    let server = PipeServer::new(endpoint.clone(), router);
    server.start().unwrap();
    wait_for_server(&endpoint);

    let response = roundtrip(&endpoint, &TmuxRequest::new("kill-pane"));
    assert_eq!(response.exit_code, 3);
    assert!(response.stderr.contains("unhandled command kill-pane"));

    server.stop().unwrap();
}

#[test]
fn malformed_requests_get_an_error_response() {
    let endpoint = test_endpoint("bad");
    let router = Arc::new(CountingRouter {
        handled: AtomicUsize::new(0),
    });
    let server = PipeServer::new(endpoint.clone(), router.clone());
    server.start().unwrap();
    wait_for_server(&endpoint);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let response: TmuxResponse = runtime.block_on(async {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        #[cfg(windows)]
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&endpoint)
            .unwrap();
        #[cfg(not(windows))]
        let stream = tokio::net::UnixStream::connect(&endpoint).await.unwrap();

        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(b"this is not json\n").await.unwrap();
        writer.flush().await.unwrap();
        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    });

    assert_eq!(response.exit_code, 1);
    assert!(response.stderr.contains("malformed request"));
    // the router never saw the malformed payload
    assert_eq!(router.handled.load(Ordering::SeqCst), 0);

    server.stop().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let endpoint = test_endpoint("stop");
    let server = PipeServer::new(
        endpoint,
        Arc::new(CountingRouter {
            handled: AtomicUsize::new(0),
        }),
    );
    // stop before start is a no-op
    server.stop().unwrap();
    server.start().unwrap();
    server.stop().unwrap();
    server.stop().unwrap();
}

#[test]
fn start_twice_is_rejected() {
    let endpoint = test_endpoint("twice");
    let server = PipeServer::new(
        endpoint,
        Arc::new(CountingRouter {
            handled: AtomicUsize::new(0),
        }),
    );
    server.start().unwrap();
    assert!(server.start().is_err());
    server.stop().unwrap();
}
