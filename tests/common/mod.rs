//! Common test utilities for integration tests

use reqwest::{redirect, Client};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use zoneroute::config::Config;
use zoneroute::proxy::DispatchServer;

/// Standard test layout: two zones, one vhost with a single-server default
/// node and a two-server round-robin node that overflows back to it.
///
/// ```text
/// z1 = 10.0.0.0/24  -> n1 (default) -> 1.1.1.1
/// z2 = 10.1.0.0/24  -> n2           -> 2.2.2.1, 2.2.2.2
/// ```
pub fn write_test_config(dir: &Path) {
    std::fs::write(dir.join("ipz"), "10.0.0.0/24;z1\n10.1.0.0/24;z2\n").unwrap();

    let vdir = dir.join("h1");
    std::fs::create_dir(&vdir).unwrap();
    std::fs::write(
        vdir.join("node.conf"),
        "[n1]\n\
         server=1.1.1.1 0\n\
         default\n\
         [n2]\n\
         server=2.2.2.1 0\n\
         server=2.2.2.2 1\n\
         balance=r\n\
         overflow2node=n1\n",
    )
    .unwrap();
    std::fs::write(vdir.join("view.conf"), "z2;n2\n").unwrap();
}

/// Start a dispatch server on a free local port, backed by the standard
/// test configuration.
pub async fn start_test_server() -> TestServer {
    let config_dir = TempDir::new().expect("Failed to create temp config dir");
    write_test_config(config_dir.path());

    let port = find_free_port().await;
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().expect("Invalid address");

    let config = Config {
        config_dir: config_dir.path().to_path_buf(),
        listen: addr.to_string(),
        foreground: true,
        ..Default::default()
    };

    let server = DispatchServer::new(config).expect("Failed to create server");

    let handle = tokio::spawn(async move {
        server.run().await.expect("Server failed");
    });

    // Wait for the listener to come up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    TestServer {
        addr,
        handle,
        _config_dir: config_dir,
    }
}

/// Find a free port for testing
async fn find_free_port() -> u16 {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind to port");
    let port = listener.local_addr().expect("Failed to get local addr").port();
    drop(listener);
    port
}

/// Test server handle
pub struct TestServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    _config_dir: TempDir,
}

impl TestServer {
    #[allow(dead_code)]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// HTTP client that does not follow redirects; the `Location` header is the
/// thing under test.
pub fn test_client() -> Client {
    Client::builder()
        .redirect(redirect::Policy::none())
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to create client")
}
