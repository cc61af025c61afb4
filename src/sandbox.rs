//! Resource-limited execution of generated programs.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use crate::error::{EvalError, Result};

const MAX_OUTPUT_DEFAULT: usize = 64 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl SandboxOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub memory_limit_mb: Option<u64>,
    pub nice: Option<i32>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: MAX_OUTPUT_DEFAULT,
            memory_limit_mb: Some(1024),
            nice: Some(10),
        }
    }
}

fn truncate_output(s: &[u8], max: usize) -> String {
    if s.len() <= max {
        String::from_utf8_lossy(s).to_string()
    } else {
        let truncated = String::from_utf8_lossy(&s[..max]).to_string();
        format!("{}\n\n... [truncated at {} bytes, total {}]", truncated, max, s.len())
    }
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Shell line running `argv` under the configured limits.
fn wrap_command(argv: &[String], cfg: &SandboxConfig) -> String {
    let mut parts = Vec::new();

    if let Some(mem_mb) = cfg.memory_limit_mb {
        parts.push(format!("ulimit -v {} 2>/dev/null;", mem_mb * 1024));
    }
    parts.push("exec".to_string());
    if let Some(nice) = cfg.nice {
        parts.push(format!("nice -n {}", nice));
    }
    parts.extend(argv.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

/// Run `argv` in `cwd`. A timeout is reported in the output, not as an error;
/// the whole process group is killed when it fires.
pub async fn run(argv: &[String], cwd: &Path, cfg: &SandboxConfig) -> Result<SandboxOutput> {
    if argv.is_empty() {
        return Err(EvalError::config("sandbox command is empty"));
    }

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(wrap_command(argv, cfg))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| EvalError::io(cwd, e))?;
    let pid = child.id();

    match tokio::time::timeout(cfg.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(SandboxOutput {
            stdout: truncate_output(&output.stdout, cfg.max_output_bytes),
            stderr: truncate_output(&output.stderr, cfg.max_output_bytes),
            exit_code: output.status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(EvalError::io(cwd, e)),
        Err(_) => {
            warn!(
                timeout_secs = cfg.timeout.as_secs_f64(),
                program = %argv[0],
                "Sandboxed program timed out"
            );
            if let Some(pid) = pid {
                let _ = Command::new("kill")
                    .args(["-9", &format!("-{}", pid)])
                    .output()
                    .await;
            }
            Ok(SandboxOutput {
                stdout: String::new(),
                stderr: format!("timed out after {:?}", cfg.timeout),
                exit_code: -1,
                timed_out: true,
            })
        }
    }
}
