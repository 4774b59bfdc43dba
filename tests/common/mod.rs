use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::LazyLock;

use serde_json::Value;
use tempfile::TempDir;

pub struct TestServer {
    pub temp_dir: TempDir,
    pub base_url: String,
    server_process: Option<Child>,
}

static BUILD_RELEASE: LazyLock<()> = LazyLock::new(|| {
    let build_status = Command::new("cargo")
        .args(["build", "--release"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("build release binary");
    assert!(build_status.success(), "Failed to build release binary");
});

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_env(&[]).await
    }

    pub async fn start_with_env(env: &[(&str, &str)]) -> Self {
        LazyLock::force(&BUILD_RELEASE);

        let temp_dir = TempDir::new().expect("create temp dir");
        let db_path = temp_dir.path().join("beadhub.db");
        let binary = Path::new(env!("CARGO_MANIFEST_DIR")).join("target/release/beadhub");

        let init_output = Command::new(&binary)
            .args(["admin", "init", "--database"])
            .arg(&db_path)
            .output()
            .expect("run init");
        assert!(init_output.status.success(), "Failed to initialize database");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let base_url = format!("http://127.0.0.1:{}", port);

        let mut command = Command::new(&binary);
        command
            .args(["serve", "--database"])
            .arg(&db_path)
            .args(["--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in env {
            command.env(key, value);
        }
        let server_process = command.spawn().expect("start server");

        Self::wait_for_ready(&base_url).await;

        Self {
            temp_dir,
            base_url,
            server_process: Some(server_process),
        }
    }

    async fn wait_for_ready(base_url: &str) {
        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/health", base_url))
                .send()
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        panic!("Server did not become ready");
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("beadhub.db")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(mut process) = self.server_process.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

pub struct Agent {
    pub workspace_id: String,
    pub alias: String,
    pub api_key: String,
    pub project_id: String,
}

/// Bootstrap a workspace through `/v1/init` and hand back its identity.
pub async fn init_agent(base_url: &str, project_slug: &str, alias: &str) -> Agent {
    let client = reqwest::Client::new();
    let resp: Value = client
        .post(format!("{}/v1/init", base_url))
        .json(&serde_json::json!({
            "project_slug": project_slug,
            "alias": alias,
            "human_name": format!("{} Human", alias),
            "repo_origin": "https://github.com/acme/widgets.git",
        }))
        .send()
        .await
        .expect("init request")
        .json()
        .await
        .expect("init response");

    Agent {
        workspace_id: resp["workspace_id"].as_str().expect("workspace_id").to_string(),
        alias: resp["alias"].as_str().expect("alias").to_string(),
        api_key: resp["api_key"].as_str().expect("api_key").to_string(),
        project_id: resp["project_id"].as_str().expect("project_id").to_string(),
    }
}
