use crate::error::{Result, SupervisorError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

pub type OutputLine = (String, String);
pub type LineSink = Arc<dyn Fn(OutputLine) + Send + Sync>;

struct Running {
    child: Child,
    pid: u32,
}

/// Starts and stops named external commands and reports liveness. Keyed by
/// model name rather than by pid so double-start detection and stop-by-name
/// work without the caller tracking pids itself.
pub struct ProcessSupervisor {
    running: Mutex<HashMap<String, Running>>,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns `command` via a shell so `script_path` may itself be a shell
    /// command line (matches the source's `shell=True` launch). Captures
    /// stdout/stderr on background tasks, forwarding each non-empty line to
    /// `on_line`.
    pub async fn start(&self, name: &str, command: &str, on_line: LineSink) -> Result<u32> {
        if self.running.lock().contains_key(name) {
            return Err(SupervisorError::ProcessSpawnFailed(format!(
                "model '{name}' already has a running process"
            )));
        }

        let mut cmd = build_shell_command(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::ProcessSpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::ProcessSpawnFailed("process exited immediately".into()))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, "stdout", on_line.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, "stderr", on_line.clone());
        }

        self.running
            .lock()
            .insert(name.to_string(), Running { child, pid });

        Ok(pid)
    }

    /// Normal stop: SIGTERM (unix) and wait up to `timeout`, escalating to a
    /// tree-kill if the process hasn't exited by then, or immediately when
    /// `force` is set. Idempotent: stopping an unknown name is a no-op
    /// success, mirroring `stop_model`'s own idempotence at the layer above.
    pub async fn stop(&self, name: &str, force: bool, timeout: Duration) -> Result<()> {
        let running = self.running.lock().remove(name);
        let Some(mut running) = running else {
            return Ok(());
        };

        if !force {
            terminate(running.pid);
            let waited = tokio::time::timeout(timeout, running.child.wait()).await;
            if waited.is_ok() {
                return Ok(());
            }
        }

        kill_tree(running.pid);
        let _ = running.child.kill().await;
        let _ = running.child.wait().await;
        Ok(())
    }

    /// Zombies count as not-alive.
    pub fn alive(&self, name: &str) -> bool {
        let mut running = self.running.lock();
        let Some(entry) = running.get_mut(name) else {
            return false;
        };
        match entry.child.try_wait() {
            Ok(None) => true,
            _ => {
                running.remove(name);
                false
            }
        }
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.running.lock().get(name).map(|r| r.pid)
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.lock().keys().cloned().collect();
        for name in names {
            let _ = self.stop(&name, true, Duration::from_secs(5)).await;
        }
    }
}

#[cfg(unix)]
fn build_shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn build_shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

/// Kills the whole process subtree, not just the shell launched for it.
#[cfg(unix)]
fn kill_tree(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    // Best-effort: ask every process in the host's tree once; a shell's
    // children die when the shell is killed in the common case, but a
    // detached grandchild can survive, so fall back to `pkill -P` for those.
    let _ = std::process::Command::new("pkill")
        .args(["-P", &pid.to_string()])
        .status();
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(windows)]
fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status();
}

fn spawn_line_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    stream_name: &'static str,
    on_line: LineSink,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                on_line((stream_name.to_string(), line));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn stopping_an_unknown_name_is_a_no_op_success() {
        let supervisor = ProcessSupervisor::new();
        supervisor
            .stop("never-started", true, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn double_start_on_the_same_name_is_rejected() {
        let supervisor = ProcessSupervisor::new();
        let lines: Arc<dyn Fn(OutputLine) + Send + Sync> = Arc::new(|_| {});
        supervisor
            .start("m", "sleep 5", lines.clone())
            .await
            .unwrap();
        let err = supervisor.start("m", "sleep 5", lines).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessSpawnFailed(_)));
        supervisor.stop("m", true, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn captured_output_reaches_the_sink() {
        let supervisor = ProcessSupervisor::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sink: LineSink = Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        supervisor
            .start("echoer", "echo hello", sink)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
