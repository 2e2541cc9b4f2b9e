use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;

/// Find a free TCP port by binding to port 0
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

/// Wait for a TCP port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for port {} to be ready", port);
        }
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Get the path to a compiled binary in the target directory
fn cargo_bin(name: &str) -> PathBuf {
    let mut path = std::env::current_exe()
        .expect("Failed to get current exe")
        .parent()
        .expect("No parent")
        .parent()
        .expect("No grandparent")
        .to_path_buf();
    path.push(name);
    if path.exists() {
        return path;
    }

    // Fallback: try target/debug directly
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // integration-tests -> workspace root
    path.push("target");
    path.push("debug");
    path.push(name);
    if path.exists() {
        return path;
    }

    panic!(
        "Binary '{}' not found. Run `cargo build --workspace` first.",
        name
    );
}

/// A running controller with its own config, state file and web root.
///
/// SSH points at a port nobody listens on, so every reachability check
/// fails fast and sighted nodes stay offline.
pub struct TestControl {
    pub port: u16,
    child: Child,
    temp_dir: TempDir,
}

impl TestControl {
    pub async fn new() -> Self {
        Self::with_state(None).await
    }

    /// Start with `state` pre-written to the state file.
    pub async fn with_state(state: Option<serde_json::Value>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        write_fixture(temp_dir.path(), state);

        let port = find_free_port();
        let child = spawn_control(temp_dir.path(), port);
        wait_for_port(port, Duration::from_secs(10)).await;

        Self {
            port,
            child,
            temp_dir,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    pub fn state_path(&self) -> PathBuf {
        self.temp_dir.path().join("state.json")
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Restart the controller (same state file, new port)
    pub async fn restart(&mut self) -> u16 {
        let _ = self.child.kill();
        let _ = self.child.wait();

        let port = find_free_port();
        self.child = spawn_control(self.temp_dir.path(), port);
        wait_for_port(port, Duration::from_secs(10)).await;

        self.port = port;
        port
    }

    pub async fn nodes(&self) -> NodesResponse {
        reqwest::get(format!("{}/nodes", self.url()))
            .await
            .expect("Failed to list nodes")
            .json::<NodesResponse>()
            .await
            .expect("Failed to parse response")
    }

    /// Poll `/nodes` until `check` holds.
    pub async fn wait_for_nodes<F>(&self, timeout: Duration, check: F) -> NodesResponse
    where
        F: Fn(&NodesResponse) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let nodes = self.nodes().await;
            if check(&nodes) {
                return nodes;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for nodes, last seen: {:?}", nodes);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub async fn post_sighting(&self, nodeinfo: serde_json::Value) {
        let resp = reqwest::Client::new()
            .post(format!("{}/api/telemetry/nodes", self.url()))
            .json(&serde_json::json!({ "nodeinfo": nodeinfo, "statistics": null }))
            .send()
            .await
            .expect("Failed to post sighting");
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }
}

impl Drop for TestControl {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_fixture(dir: &Path, state: Option<serde_json::Value>) {
    let closed_port = find_free_port();
    let config = format!(
        r#"
webroot = "{webroot}"
state_path = "{state}"
save_interval_secs = 1

[ssh]
private_key = "{key}"
port = {closed_port}
timeout_secs = 1
"#,
        webroot = dir.join("webroot").display(),
        state = dir.join("state.json").display(),
        key = dir.join("id_rsa").display(),
    );
    std::fs::write(dir.join("config.toml"), config).expect("Failed to write config");

    std::fs::create_dir_all(dir.join("webroot")).expect("Failed to create webroot");
    std::fs::write(
        dir.join("webroot").join("index.html"),
        "<html><body>meshfleet console</body></html>",
    )
    .expect("Failed to write index.html");

    if let Some(state) = state {
        std::fs::write(dir.join("state.json"), state.to_string()).expect("Failed to seed state");
    }
}

fn spawn_control(dir: &Path, port: u16) -> Child {
    Command::new(cargo_bin("meshfleet-control"))
        .args(["--config", dir.join("config.toml").to_str().unwrap()])
        .args(["--bind", &format!("127.0.0.1:{}", port)])
        .args(["--log-level", "debug"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("Failed to start controller")
}

/// Raw nodeinfo as the collector reports it.
pub fn nodeinfo(node_id: &str, hostname: &str) -> serde_json::Value {
    serde_json::json!({
        "node_id": node_id,
        "hostname": hostname,
        "network": { "addresses": ["127.0.0.1"] },
        "owner": { "contact": "ops@example.org" },
        "wireless": { "channel24": 1, "channel5": 44, "txpower24": 10, "txpower5": 17 }
    })
}

/// Persisted state with one record per id.
pub fn seeded_state(node_ids: &[&str]) -> serde_json::Value {
    let nodes: serde_json::Map<String, serde_json::Value> = node_ids
        .iter()
        .map(|id| {
            (
                id.to_string(),
                serde_json::json!({
                    "node_id": id,
                    "hostname": format!("node-{}", id),
                    "address": "127.0.0.1",
                    "owner": "ops@example.org",
                    "lastseen": "2024-05-01T10:00:00Z"
                }),
            )
        })
        .collect();
    serde_json::json!({ "nodes": nodes })
}

/// Response types for deserialization
#[derive(Debug, serde::Deserialize)]
pub struct Node {
    pub node_id: String,
    pub hostname: String,
    pub owner: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct NodesResponse {
    pub nodes: std::collections::BTreeMap<String, Node>,
    pub current: std::collections::BTreeMap<String, Node>,
}
