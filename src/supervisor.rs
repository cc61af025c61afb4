//! Lifecycle of a locally hosted model-serving subprocess.
//!
//! One `ServerHandle` owns one serving process group. The evaluator makes sure
//! a stage's handle is terminated before the next stage asks for a server,
//! since only one model can occupy the accelerators at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{EvalError, Result};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_MODEL_LEN: u32 = 4096;
const DEFAULT_MAX_NUM_SEQS: u32 = 256;
const DEFAULT_STARTUP_TIMEOUT: u64 = 900;
const DEFAULT_INITIAL_DELAY_MS: u64 = 250;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SHUTDOWN_GRACE: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    pub model_path: String,
    pub model_name: String,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub dtype: String,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            model_name: String::new(),
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            max_num_seqs: DEFAULT_MAX_NUM_SEQS,
            dtype: "auto".to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerSpec {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupPolicy {
    pub timeout_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_STARTUP_TIMEOUT,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

pub struct ServerHandle {
    host: String,
    port: u16,
    child: Option<Child>,
    pid: Option<u32>,
}

impl ServerHandle {
    /// Handle for a server this process does not own (endpoint mode, tests).
    pub fn detached(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            child: None,
            pid: None,
        }
    }

    pub(crate) fn from_child(host: impl Into<String>, port: u16, child: Child) -> Self {
        let pid = child.id();
        Self {
            host: host.into(),
            port,
            child: Some(child),
            pid,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = self.pid {
                warn!(pid, "Server handle dropped while running, killing process tree");
                kill_tree_blocking(pid);
            }
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn setup_server(&self, spec: &ServerSpec) -> Result<ServerHandle>;

    /// Idempotent; `None` is a no-op.
    async fn terminate_server(&self, handle: Option<ServerHandle>);
}

pub struct LocalServerLauncher {
    command: Vec<String>,
    extra_args: Vec<String>,
    policy: StartupPolicy,
    accelerators: Option<usize>,
    log_dir: Option<PathBuf>,
}

impl LocalServerLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            extra_args: Vec::new(),
            policy: StartupPolicy::default(),
            accelerators: None,
            log_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: StartupPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Fix the accelerator count instead of probing the host.
    pub fn with_accelerators(mut self, count: usize) -> Self {
        self.accelerators = Some(count);
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = Some(dir);
        self
    }

    pub fn build_args(&self, spec: &ServerSpec, tensor_parallel: usize) -> Vec<String> {
        let mut args = vec![
            spec.model_path.clone(),
            "--served-model-name".to_string(),
            spec.model_name.clone(),
            "--host".to_string(),
            spec.host.clone(),
            "--port".to_string(),
            spec.port.to_string(),
            "--tensor-parallel-size".to_string(),
            tensor_parallel.to_string(),
            "--dtype".to_string(),
            spec.dtype.clone(),
            "--max-model-len".to_string(),
            spec.max_model_len.to_string(),
            "--max-num-seqs".to_string(),
            spec.max_num_seqs.to_string(),
            "--swap-space".to_string(),
            "0".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn output_streams(&self, spec: &ServerSpec) -> (Stdio, Stdio) {
        let Some(ref dir) = self.log_dir else {
            return (Stdio::null(), Stdio::null());
        };
        let name = spec.model_name.replace(['/', ' '], "_");
        let path = dir.join(format!("server-{}.log", name));
        match std::fs::File::create(&path).and_then(|f| Ok((f.try_clone()?, f))) {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!("Failed to open server log {}: {}", path.display(), e);
                (Stdio::null(), Stdio::null())
            }
        }
    }
}

#[async_trait]
impl ServerLauncher for LocalServerLauncher {
    async fn setup_server(&self, spec: &ServerSpec) -> Result<ServerHandle> {
        let (program, base_args) = self
            .command
            .split_first()
            .ok_or_else(|| EvalError::config("server command is empty"))?;

        let accelerators = match self.accelerators {
            Some(n) => n,
            None => detect_accelerators().await,
        };
        let tensor_parallel = tensor_parallel_degree(accelerators);
        let args = self.build_args(spec, tensor_parallel);

        info!(
            model = %spec.model_name,
            address = %spec.address(),
            accelerators,
            tensor_parallel,
            "Starting model server"
        );
        debug!("Server command: {} {:?} {:?}", program, base_args, args);

        let (stdout, stderr) = self.output_streams(spec);
        let mut cmd = Command::new(program);
        cmd.args(base_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        // New process group so the whole serving tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| EvalError::ServerStartup {
            address: spec.address(),
            message: format!("failed to spawn {}: {}", program, e),
        })?;

        let mut handle = ServerHandle::from_child(spec.host.clone(), spec.port, child);
        let start = Instant::now();
        if let Err(e) = wait_until_ready(&mut handle, &self.policy).await {
            warn!(address = %spec.address(), error = %e, "Model server failed to become ready");
            self.terminate_server(Some(handle)).await;
            return Err(e);
        }

        info!(
            model = %spec.model_name,
            address = %spec.address(),
            startup_ms = start.elapsed().as_millis() as u64,
            "Model server ready"
        );
        Ok(handle)
    }

    async fn terminate_server(&self, handle: Option<ServerHandle>) {
        if let Some(handle) = handle {
            terminate_process_tree(
                handle,
                Duration::from_secs(self.policy.shutdown_grace_secs),
            )
            .await;
        }
    }
}

/// Poll a TCP connect with exponential backoff until the server accepts
/// connections, the process exits, or the startup timeout elapses.
pub async fn wait_until_ready(handle: &mut ServerHandle, policy: &StartupPolicy) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(policy.timeout_secs);
    let connect_timeout = Duration::from_millis(policy.connect_timeout_ms);
    let max_delay = Duration::from_millis(policy.max_delay_ms);
    let mut delay = Duration::from_millis(policy.initial_delay_ms);
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        if let Some(child) = handle.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(EvalError::ServerStartup {
                    address: handle.address(),
                    message: format!("server process exited during startup ({})", status),
                });
            }
        }

        let addr = (handle.host.as_str(), handle.port);
        if let Ok(Ok(_)) = tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            debug!(address = %handle.address(), attempts, "Server port is accepting connections");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EvalError::ServerStartup {
                address: handle.address(),
                message: format!(
                    "not reachable after {}s ({} attempts)",
                    policy.timeout_secs, attempts
                ),
            });
        }

        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// SIGTERM every descendant, then the parent; escalate to SIGKILL on the
/// process group when the parent outlives the grace period.
pub async fn terminate_process_tree(mut handle: ServerHandle, grace: Duration) {
    let Some(mut child) = handle.child.take() else {
        return;
    };
    let address = handle.address();

    match handle.pid {
        Some(pid) => {
            let descendants = descendant_pids(pid);
            debug!(pid, descendants = descendants.len(), "Terminating server process tree");
            for d in &descendants {
                send_signal(*d, "TERM").await;
            }
            send_signal(pid, "TERM").await;
        }
        None => {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(address = %address, %status, "Model server stopped"),
        Ok(Err(e)) => warn!(address = %address, "Failed to wait for model server: {}", e),
        Err(_) => {
            warn!(
                address = %address,
                grace_secs = grace.as_secs(),
                "Model server ignored SIGTERM, killing"
            );
            let _ = child.kill().await;
        }
    }

    if let Some(pid) = handle.pid {
        kill_process_group(pid).await;
    }
}

async fn send_signal(pid: u32, signal: &str) {
    let _ = Command::new("kill")
        .args([format!("-{}", signal), pid.to_string()])
        .output()
        .await;
}

async fn kill_process_group(pgid: u32) {
    let _ = Command::new("kill")
        .args(["-9", &format!("-{}", pgid)])
        .output()
        .await;
}

fn kill_tree_blocking(pid: u32) {
    for d in descendant_pids(pid) {
        let _ = std::process::Command::new("kill")
            .args(["-9", &d.to_string()])
            .output();
    }
    let _ = std::process::Command::new("kill")
        .args(["-9", &format!("-{}", pid)])
        .output();
}

/// All transitive children of `root`, breadth first, from a fresh
/// snapshot of the process table.
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        // Threads share their process' signals.
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    walk_descendants(&children, root)
}

fn walk_descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                found.push(*kid);
                queue.push_back(*kid);
            }
        }
    }
    found
}

/// Serving engines need a power-of-two tensor-parallel degree.
pub fn tensor_parallel_degree(accelerators: usize) -> usize {
    if accelerators <= 1 {
        return 1;
    }
    1 << (usize::BITS - 1 - accelerators.leading_zeros())
}

pub fn count_visible_devices(value: &str) -> usize {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "-1")
        .count()
}

pub async fn detect_accelerators() -> usize {
    if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
        return count_visible_devices(&visible);
    }
    match Command::new("nvidia-smi").arg("-L").output().await {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| l.starts_with("GPU"))
            .count(),
        _ => 0,
    }
}
