use std::{
    collections::HashMap,
    fs,
    io::Write as _,
    net::TcpListener,
    path::{Path, PathBuf},
    process::Stdio,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use glob::glob;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tempfile::TempDir;
use test_bin::get_test_bin;
use tokio::process::{Child, Command};

fn wait_for<F>(mut predicate: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate().context("timeout predicate failed")? {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    bail!("timeout after {:?}", timeout)
}

// Add a reasonable method for sending general signals, Rust only provides a
// method to SIGKILL.
trait ChildExt {
    fn signal(&self, sig: Signal) -> anyhow::Result<()>;
}

impl ChildExt for Child {
    fn signal(&self, sig: Signal) -> anyhow::Result<()> {
        let pid = Pid::from_raw(
            self.id()
                .context("no PID for child")?
                .try_into()
                .context("couldn't parse child PID")?,
        );
        kill(pid, sig).context("couldn't signal child")
    }
}

struct SupervisorBuilder {
    temp_dir: TempDir,
    config_lines: Vec<String>,
}

impl SupervisorBuilder {
    // A fixture with an origin repository at <temp>/origin containing an
    // executable ci.sh with the given contents, and a work dir at
    // <temp>/work.
    async fn new(test_script: &str) -> anyhow::Result<Self> {
        let temp_dir = TempDir::new()?;
        let origin = temp_dir.path().join("origin");
        fs::create_dir(&origin)?;
        run_git(&origin, &["init", "-b", "main"]).await?;
        run_git(&origin, &["config", "user.email", "ci@example.com"]).await?;
        run_git(&origin, &["config", "user.name", "integration test"]).await?;

        let zelf = Self {
            temp_dir,
            config_lines: Vec::new(),
        };
        zelf.commit_script("ci.sh", test_script).await?;
        Ok(zelf)
    }

    fn origin(&self) -> PathBuf {
        self.temp_dir.path().join("origin")
    }

    fn work_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    async fn commit_script(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let path = self.origin().join(name);
        fs::write(&path, format!("#!/bin/bash\n{content}\n"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        run_git(&self.origin(), &["add", name]).await?;
        run_git(&self.origin(), &["commit", "-m", &format!("add {name}")]).await?;
        Ok(())
    }

    fn config_line(mut self, line: &str) -> Self {
        self.config_lines.push(line.to_owned());
        self
    }

    async fn start(self) -> anyhow::Result<Supervisor> {
        let config_path = self.temp_dir.path().join("home-ci.yaml");
        let mut config = format!(
            "repository: {}\nrepo_name: testrepo\nwork_dir: {}\ncheck_interval_s: 1\ntest_script: ci.sh\n",
            self.origin().display(),
            self.work_dir().display(),
        );
        for line in &self.config_lines {
            config.push_str(line);
            config.push('\n');
        }
        fs::write(&config_path, config)?;

        let mut cmd: Command = get_test_bin("home-ci").into();
        let child = cmd
            .args(["--config", config_path.to_str().unwrap(), "--log", "debug"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning home-ci")?;
        Ok(Supervisor {
            temp_dir: self.temp_dir,
            child,
        })
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("running git")?;
    if !status.success() {
        bail!("git {:?} failed: {:?}", args, status);
    }
    Ok(())
}

// An instance of the supervisor, running as a child process.
struct Supervisor {
    temp_dir: TempDir,
    child: Child,
}

impl Supervisor {
    fn origin(&self) -> PathBuf {
        self.temp_dir.path().join("origin")
    }

    fn state_file(&self) -> PathBuf {
        self.temp_dir
            .path()
            .join("work")
            .join("state")
            .join("testrepo.json")
    }

    fn state(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_str(&fs::read_to_string(
            self.state_file(),
        )?)?)
    }

    // Parsed result JSON files, oldest first.
    fn results(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        let pattern = self
            .temp_dir
            .path()
            .join("work")
            .join("testrepo")
            .join("*")
            .join("logs")
            .join("*.json");
        let mut paths: Vec<PathBuf> = glob(pattern.to_string_lossy().as_ref())?
            .collect::<Result<_, _>>()?;
        paths.sort();
        paths
            .iter()
            .map(|p| Ok(serde_json::from_str(&fs::read_to_string(p)?)?))
            .collect()
    }

    fn head_commit(&self) -> anyhow::Result<String> {
        let output = std::process::Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(self.origin())
            .output()?;
        Ok(String::from_utf8(output.stdout)?.trim().to_owned())
    }

    fn wait_for_results(&self, want: usize) -> anyhow::Result<()> {
        wait_for(
            || Ok(self.results()?.len() >= want),
            Duration::from_secs(30),
        )
    }

    // SIGINT and wait for a clean exit.
    async fn terminate(mut self) -> anyhow::Result<()> {
        self.child.signal(Signal::SIGINT)?;
        let status = tokio::time::timeout(Duration::from_secs(15), self.child.wait())
            .await
            .context("supervisor didn't exit after SIGINT")??;
        if !status.success() {
            bail!("supervisor exited uncleanly: {:?}", status);
        }
        Ok(())
    }
}

#[tokio::test]
async fn successful_run_updates_state() {
    let supervisor = SupervisorBuilder::new("echo all good")
        .await
        .unwrap()
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    let results = supervisor.results().unwrap();
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[0]["timed_out"], false);
    assert_eq!(results[0]["branch"], "main");

    let head = supervisor.head_commit().unwrap();
    wait_for(
        || {
            let state = supervisor.state()?;
            Ok(state["branch_states"]["main"]["latest_commit"] == head.as_str()
                && state["running_tests"].as_array().is_some_and(Vec::is_empty))
        },
        Duration::from_secs(10),
    )
    .expect("state never settled");

    supervisor.terminate().await.unwrap();
}

#[tokio::test]
async fn failing_run_is_not_retried() {
    let supervisor = SupervisorBuilder::new("echo oh no; exit 1")
        .await
        .unwrap()
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    let results = supervisor.results().unwrap();
    assert_eq!(results[0]["success"], false);
    assert_eq!(results[0]["timed_out"], false);
    assert!(
        !results[0]["error_message"].as_str().unwrap().is_empty(),
        "expected an error message"
    );

    // The branch state still advanced, so several more ticks must not
    // produce another run for the same commit.
    thread::sleep(Duration::from_secs(3));
    assert_eq!(supervisor.results().unwrap().len(), 1);

    supervisor.terminate().await.unwrap();
}

#[tokio::test]
async fn timeout_terminates_script() {
    let supervisor = SupervisorBuilder::new("sleep 120")
        .await
        .unwrap()
        .config_line("test_timeout_s: 2")
        .start()
        .await
        .unwrap();

    let start = Instant::now();
    supervisor.wait_for_results(1).unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(30),
        "timed-out run took {:?} to finalize",
        start.elapsed()
    );
    let results = supervisor.results().unwrap();
    assert_eq!(results[0]["timed_out"], true);
    assert_eq!(results[0]["success"], false);

    wait_for(
        || {
            Ok(supervisor.state()?["running_tests"]
                .as_array()
                .is_some_and(Vec::is_empty))
        },
        Duration::from_secs(10),
    )
    .unwrap();

    supervisor.terminate().await.unwrap();
}

#[tokio::test]
async fn cleanup_runs_when_test_fails() {
    let builder = SupervisorBuilder::new("exit 1").await.unwrap();
    builder
        .commit_script("cleanup.sh", "echo cleaning up")
        .await
        .unwrap();
    let supervisor = builder
        .config_line("cleanup:")
        .config_line("  after_e2e: true")
        .config_line("  script: cleanup.sh")
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    let results = supervisor.results().unwrap();
    assert_eq!(results[0]["success"], false);
    assert_eq!(results[0]["cleanup_executed"], true);
    assert_eq!(results[0]["cleanup_success"], true);

    supervisor.terminate().await.unwrap();
}

#[tokio::test]
async fn new_commit_triggers_second_run() {
    let supervisor = SupervisorBuilder::new("echo run me")
        .await
        .unwrap()
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    run_git(
        &supervisor.origin(),
        &["commit", "--allow-empty", "-m", "go again"],
    )
    .await
    .unwrap();
    supervisor.wait_for_results(2).unwrap();

    let head = supervisor.head_commit().unwrap();
    wait_for(
        || Ok(supervisor.state()?["branch_states"]["main"]["latest_commit"] == head.as_str()),
        Duration::from_secs(10),
    )
    .unwrap();

    supervisor.terminate().await.unwrap();
}

// A minimal HTTP listener for the dispatch POST, running on a plain std
// TcpListener in a thread so the test doesn't need a server framework.
struct DispatchReceiver {
    port: u16,
    handle: thread::JoinHandle<(String, HashMap<String, String>, serde_json::Value)>,
}

impl DispatchReceiver {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            use std::io::Read as _;
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let body_start = loop {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed early");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8(buf[..body_start - 4].to_vec()).unwrap();
            let mut lines = head.lines();
            let request_line = lines.next().unwrap().to_owned();
            let headers: HashMap<String, String> = lines
                .filter_map(|l| l.split_once(": "))
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_owned()))
                .collect();
            let content_length: usize = headers["content-length"].parse().unwrap();
            while buf.len() < body_start + content_length {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "connection closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
            let body =
                serde_json::from_slice(&buf[body_start..body_start + content_length]).unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .unwrap();
            (request_line, headers, body)
        });
        Self { port, handle }
    }
}

#[tokio::test]
async fn dispatch_posts_artifacts() {
    let receiver = DispatchReceiver::start();
    let builder = SupervisorBuilder::new("echo 'status: all-fine' > \"$HOME_CI_RESULT_FILE\"")
        .await
        .unwrap();
    fs::write(builder.temp_dir.path().join("token"), "hunter2\n").unwrap();
    let token_path = builder.temp_dir.path().join("token");
    let supervisor = builder
        .config_line("dispatch:")
        .config_line("  enabled: true")
        .config_line("  target_repo: k8s-school/ci-results")
        .config_line(&format!("  token_file: {}", token_path.display()))
        .config_line("  requires_result_file: true")
        .config_line(&format!("  api_base: http://127.0.0.1:{}", receiver.port))
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    wait_for(
        || Ok(supervisor.results()?[0]["dispatch_notified"] == true),
        Duration::from_secs(10),
    )
    .unwrap();
    let results = supervisor.results().unwrap();
    assert_eq!(results[0]["dispatch_success"], true);
    supervisor.terminate().await.unwrap();

    let (request_line, headers, body) = receiver.handle.join().unwrap();
    assert_eq!(
        request_line,
        "POST /repos/k8s-school/ci-results/dispatches HTTP/1.1"
    );
    assert_eq!(headers["authorization"], "Bearer hunter2");
    assert_eq!(body["event_type"], "test-success");
    let artifacts = body["client_payload"]["artifacts"].as_array().unwrap();
    let kinds: Vec<&str> = artifacts
        .iter()
        .map(|a| a["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["log", "result", "e2e-report"]);
    let report = BASE64
        .decode(artifacts[2]["content"].as_str().unwrap())
        .unwrap();
    assert_eq!(String::from_utf8(report).unwrap(), "status: all-fine\n");
}

#[tokio::test]
async fn dispatch_missing_result_file_marks_failure() {
    // Script doesn't write $HOME_CI_RESULT_FILE but the config demands it.
    // Nothing listens on the api_base port; no request should be attempted.
    let builder = SupervisorBuilder::new("echo no report from me").await.unwrap();
    fs::write(builder.temp_dir.path().join("token"), "hunter2\n").unwrap();
    let token_path = builder.temp_dir.path().join("token");
    let supervisor = builder
        .config_line("dispatch:")
        .config_line("  enabled: true")
        .config_line("  target_repo: k8s-school/ci-results")
        .config_line(&format!("  token_file: {}", token_path.display()))
        .config_line("  requires_result_file: true")
        .config_line("  api_base: http://127.0.0.1:9")
        .start()
        .await
        .unwrap();

    supervisor.wait_for_results(1).unwrap();
    let results = supervisor.results().unwrap();
    // The run itself is fine, only the notification failed.
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[0]["dispatch_notified"], true);
    assert_eq!(results[0]["dispatch_success"], false);
    assert!(!results[0]["dispatch_error_message"]
        .as_str()
        .unwrap()
        .is_empty());

    supervisor.terminate().await.unwrap();
}

#[tokio::test]
async fn sigint_shuts_down_cleanly_with_run_in_flight() {
    let supervisor = SupervisorBuilder::new("sleep 120")
        .await
        .unwrap()
        .config_line("test_timeout_s: 600")
        .start()
        .await
        .unwrap();

    // Wait for the run to be registered, then interrupt mid-flight.
    wait_for(
        || {
            Ok(supervisor
                .state()
                .map(|s| s["running_tests"].as_array().is_some_and(|t| !t.is_empty()))
                .unwrap_or(false))
        },
        Duration::from_secs(30),
    )
    .unwrap();

    supervisor.terminate().await.unwrap();
}
