use bytes::Bytes;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::metrics::ENCODER_CPU_USAGE;

/// Lifecycle of one external encoder invocation.
///
/// `Completed` covers exit 0 and the encoder's habit of exiting 255 after a
/// clean EOF once bytes have flowed. Exit 255 before any output, or any other
/// non-zero code, is `Errored`. `kill()` from any state lands in `Killed`,
/// including before the spawn happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Spawning,
    Running,
    Completed,
    Errored,
    Killed,
}

impl EncoderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EncoderState::Completed | EncoderState::Errored | EncoderState::Killed
        )
    }
}

pub struct Encoder {
    stop: watch::Sender<bool>,
    state_rx: watch::Receiver<EncoderState>,
    channel_label: String,
}

const READ_BUF_SIZE: usize = 64 * 1024;
const STDERR_RING_LINES: usize = 50;

/// True when the configured encoder executable can actually be invoked:
/// either a path that exists on disk, or a bare name found on PATH.
pub async fn encoder_available(path: &str) -> bool {
    if path.contains('/') {
        return tokio::fs::metadata(path).await.is_ok();
    }
    let Some(dirs) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&dirs) {
        if tokio::fs::metadata(dir.join(path)).await.is_ok() {
            return true;
        }
    }
    false
}

impl Encoder {
    /// Spawns `executable args...` with stdout piped into the returned byte
    /// channel. The receiver closes once the process reaches a terminal
    /// state; dropping it kills the process.
    pub fn spawn(
        executable: impl AsRef<Path>,
        args: Vec<String>,
        channel_label: impl Into<String>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let channel_label = channel_label.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(EncoderState::Spawning);
        let (data_tx, data_rx) = mpsc::channel(64);

        let executable = executable.as_ref().to_path_buf();
        let label = channel_label.clone();
        tokio::spawn(async move {
            run_encoder(executable, args, stop_rx, state_tx, data_tx, label).await;
        });

        (
            Encoder {
                stop: stop_tx,
                state_rx,
                channel_label,
            },
            data_rx,
        )
    }

    /// Requests termination from any state. Safe to call repeatedly; honored
    /// even when the spawn has not happened yet.
    pub fn kill(&self) {
        let _ = self.stop.send(true);
    }

    pub fn state(&self) -> EncoderState {
        *self.state_rx.borrow()
    }

    /// Resolves once the process reaches a terminal state.
    pub async fn wait(&self) -> EncoderState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        ENCODER_CPU_USAGE
            .with_label_values(&[&self.channel_label])
            .set(0.0);
    }
}

async fn run_encoder(
    executable: std::path::PathBuf,
    args: Vec<String>,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<EncoderState>,
    data_tx: mpsc::Sender<Bytes>,
    label: String,
) {
    // Preemptive kill: the request was torn down before this task first ran.
    if *stop_rx.borrow() {
        let _ = state_tx.send(EncoderState::Killed);
        return;
    }

    debug!(
        "starting encoder: {} {}",
        executable.display(),
        args.join(" ")
    );

    let child = Command::new(&executable)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            error!("failed to spawn encoder {}: {}", executable.display(), e);
            let _ = state_tx.send(EncoderState::Errored);
            return;
        }
    };

    // The stop flag may have flipped while the spawn syscall ran.
    if *stop_rx.borrow() {
        let _ = child.kill().await;
        let _ = child.wait().await;
        let _ = state_tx.send(EncoderState::Killed);
        return;
    }
    let _ = state_tx.send(EncoderState::Running);

    if let Some(pid) = child.id() {
        spawn_cpu_monitor(pid, label.clone(), stop_rx.clone());
    }

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    // Rolling tail of stderr so abnormal exits come with context without
    // spamming the log while the encoder runs.
    let stderr_ring: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_LINES)));
    let ring_for_reader = Arc::clone(&stderr_ring);
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut buffer = String::new();
        while let Ok(n) = reader.read_line(&mut buffer).await {
            if n == 0 {
                break;
            }
            let line = buffer.trim().to_string();
            {
                let mut ring = ring_for_reader.lock().await;
                if ring.len() >= STDERR_RING_LINES {
                    ring.pop_front();
                }
                ring.push_back(line.clone());
            }
            debug!("encoder: {}", line);
            buffer.clear();
        }
    });

    let mut buffer = [0u8; READ_BUF_SIZE];
    let mut produced_bytes = false;
    let mut killed = false;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                killed = true;
                let _ = child.kill().await;
                break;
            }
            read = stdout.read(&mut buffer) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        produced_bytes = true;
                        if data_tx.send(Bytes::copy_from_slice(&buffer[..n])).await.is_err() {
                            // Receiver gone: the client disconnected.
                            killed = true;
                            let _ = child.kill().await;
                            break;
                        }
                    }
                    Err(e) => {
                        error!("error reading encoder stdout: {} (channel={})", e, label);
                        break;
                    }
                }
            }
        }
    }

    let final_state = match child.wait().await {
        Ok(status) if killed => {
            info!(
                "encoder stopped (requested): channel={} status={}",
                label, status
            );
            EncoderState::Killed
        }
        Ok(status) => match status.code() {
            Some(0) => EncoderState::Completed,
            // 255 after bytes is the encoder's normal end-of-stream notice.
            Some(255) if produced_bytes => EncoderState::Completed,
            Some(code) => {
                let ring = stderr_ring.lock().await;
                if ring.is_empty() {
                    warn!(
                        "encoder exited with code {}: channel={} (no stderr captured)",
                        code, label
                    );
                } else {
                    warn!(
                        "encoder exited with code {}: channel={} last_stderr_lines=\n{}",
                        code,
                        label,
                        ring.iter().cloned().collect::<Vec<_>>().join("\n")
                    );
                }
                EncoderState::Errored
            }
            // Terminated by a signal we did not send.
            None => EncoderState::Killed,
        },
        Err(e) => {
            warn!("encoder wait() failed: channel={} err={}", label, e);
            EncoderState::Errored
        }
    };
    let _ = state_tx.send(final_state);
}

fn spawn_cpu_monitor(pid: u32, label: String, mut stop_rx: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                    let targets = sysinfo::ProcessesToUpdate::Some(&[pid]);
                    sys.refresh_processes(targets, true);
                    match sys.process(pid) {
                        Some(process) => {
                            ENCODER_CPU_USAGE
                                .with_label_values(&[&label])
                                .set(process.cpu_usage() as f64);
                        }
                        None => break,
                    }
                }
            }
        }
    });
}
