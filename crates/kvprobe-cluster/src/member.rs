//! Member process supervision

use std::collections::VecDeque;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kvprobe_core::{MemberExit, ProbeError, ProbeResult};

use crate::config::ClusterConfig;

/// Log line a member prints once it serves client traffic
pub const READY_MARKER: &str = "ready to serve client requests";

/// Stderr lines kept for error reports
const LOG_TAIL_LINES: usize = 20;

/// How long an exited member's remaining output is awaited
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Whether a member bootstraps a cluster or joins one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    New,
    Existing,
}

impl ClusterState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::New => "new",
            ClusterState::Existing => "existing",
        }
    }
}

/// Name, addresses and data dir of one member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberSpec {
    pub name: String,
    pub client_url: String,
    pub peer_url: String,
    pub data_dir: PathBuf,
}

impl MemberSpec {
    /// Allocate fresh loopback ports for member `index`.
    ///
    /// The ports stay bound by the returned reservation until the member
    /// is spawned.
    pub fn allocate(index: usize, host: &str, data_root: &Path) -> ProbeResult<(Self, PortReservation)> {
        let name = format!("m{}", index);
        let client = reserve_port(host)?;
        let peer = reserve_port(host)?;
        let spec = MemberSpec {
            client_url: format!("http://{}:{}", host, client.port),
            peer_url: format!("http://{}:{}", host, peer.port),
            data_dir: data_root.join(format!("{}.etcd", name)),
            name,
        };
        Ok((spec, PortReservation { held: vec![client, peer] }))
    }

    /// `name=peer_url` entry for `--initial-cluster`
    pub fn initial_cluster_entry(&self) -> String {
        format!("{}={}", self.name, self.peer_url)
    }
}

struct HeldPort {
    port: u16,
    _listener: TcpListener,
}

/// Listeners keeping a member's ports taken until its process starts
pub struct PortReservation {
    held: Vec<HeldPort>,
}

impl PortReservation {
    pub fn ports(&self) -> Vec<u16> {
        self.held.iter().map(|p| p.port).collect()
    }
}

/// Bind an OS-chosen TCP port and keep it bound
fn reserve_port(host: &str) -> ProbeResult<HeldPort> {
    let listener = TcpListener::bind((host, 0))
        .map_err(|e| ProbeError::io(format!("allocating a port on {}", host), e))?;
    let port = listener
        .local_addr()
        .map_err(|e| ProbeError::io("reading allocated port", e))?
        .port();
    Ok(HeldPort {
        port,
        _listener: listener,
    })
}

/// A running member process
pub struct MemberProcess {
    spec: MemberSpec,
    child: Child,
    ready: watch::Receiver<bool>,
    log_tail: Arc<Mutex<VecDeque<String>>>,
    pump: JoinHandle<()>,
}

impl MemberProcess {
    /// Spawn the server binary for `spec`, releasing `ports` just before
    pub fn spawn(
        config: &ClusterConfig,
        spec: MemberSpec,
        ports: PortReservation,
        initial_cluster: &str,
        token: &str,
        state: ClusterState,
    ) -> ProbeResult<Self> {
        let mut command = Command::new(&config.etcd_bin);
        command
            .arg("--name")
            .arg(&spec.name)
            .arg("--data-dir")
            .arg(&spec.data_dir)
            .arg("--listen-client-urls")
            .arg(&spec.client_url)
            .arg("--advertise-client-urls")
            .arg(&spec.client_url)
            .arg("--listen-peer-urls")
            .arg(&spec.peer_url)
            .arg("--initial-advertise-peer-urls")
            .arg(&spec.peer_url)
            .arg("--initial-cluster")
            .arg(initial_cluster)
            .arg("--initial-cluster-token")
            .arg(token)
            .arg("--initial-cluster-state")
            .arg(state.as_str())
            .arg("--snapshot-count")
            .arg(config.snapshot_count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        drop(ports);
        let mut child = command.spawn().map_err(|e| ProbeError::Startup {
            member: spec.name.clone(),
            reason: format!("could not spawn {}: {}", config.etcd_bin.display(), e),
        })?;

        tracing::info!(
            member = %spec.name,
            client_url = %spec.client_url,
            peer_url = %spec.peer_url,
            state = state.as_str(),
            pid = ?child.id(),
            "started member process"
        );

        let (ready_tx, ready) = watch::channel(false);
        let log_tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        let pump = match child.stderr.take() {
            Some(stderr) => start_log_pump(spec.name.clone(), stderr, ready_tx, Arc::clone(&log_tail)),
            None => tokio::spawn(async {}),
        };

        Ok(MemberProcess {
            spec,
            child,
            ready,
            log_tail,
            pump,
        })
    }

    pub fn spec(&self) -> &MemberSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn client_url(&self) -> &str {
        &self.spec.client_url
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Last few stderr lines, oldest first
    pub fn log_tail(&self) -> Vec<String> {
        self.log_tail.lock().iter().cloned().collect()
    }

    fn startup_error(&self, reason: String) -> ProbeError {
        let tail = self.log_tail();
        let reason = if tail.is_empty() {
            reason
        } else {
            format!("{}; last output:\n{}", reason, tail.join("\n"))
        };
        ProbeError::Startup {
            member: self.spec.name.clone(),
            reason,
        }
    }

    /// Block until the member logs its readiness marker
    pub async fn wait_ready(&mut self, timeout: Duration) -> ProbeResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if *self.ready.borrow_and_update() {
                tracing::info!(member = %self.spec.name, "member ready");
                return Ok(());
            }

            if let Some(status) = self.child.try_wait().map_err(|e| {
                ProbeError::io(format!("polling member {}", self.spec.name), e)
            })? {
                self.drain_output().await;
                return Err(self.startup_error(format!("exited before becoming ready ({})", status)));
            }

            match tokio::time::timeout_at(deadline, self.ready.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    // Stderr closed without the marker: the process is going away.
                    let status = tokio::time::timeout_at(deadline, self.child.wait()).await;
                    let reason = match status {
                        Ok(Ok(status)) => format!("exited before becoming ready ({})", status),
                        Ok(Err(e)) => format!("closed its output and could not be polled: {}", e),
                        Err(_) => format!("closed its output and did not become ready within {:?}", timeout),
                    };
                    return Err(self.startup_error(reason));
                }
                Err(_) => {
                    return Err(self.startup_error(format!("not ready within {:?}", timeout)));
                }
            }
        }
    }

    /// Give the log pump a moment to consume output of an exited process
    async fn drain_output(&mut self) {
        let closed = async {
            while self.ready.changed().await.is_ok() {}
        };
        let _ = tokio::time::timeout(OUTPUT_DRAIN, closed).await;
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(mut self, grace: Duration) -> MemberExit {
        let name = self.spec.name.clone();

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::warn!(member = %name, %status, "member had already exited");
            self.pump.abort();
            return exit_of(name, status, false);
        }

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(member = %name, error = %e, "SIGTERM failed");
            }
        }

        let exit = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => exit_of(name, status, false),
            Ok(Err(e)) => {
                tracing::warn!(member = %name, error = %e, "waiting for member failed");
                MemberExit {
                    member: name,
                    code: None,
                    forced: false,
                }
            }
            Err(_) => {
                tracing::warn!(member = %name, ?grace, "member ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(member = %name, error = %e, "SIGKILL failed");
                }
                let code = self.child.wait().await.ok().and_then(|s| s.code());
                MemberExit {
                    member: name,
                    code,
                    forced: true,
                }
            }
        };

        self.pump.abort();
        tracing::info!(member = %exit.member, code = ?exit.code, forced = exit.forced, "member stopped");
        exit
    }

    /// Kill without waiting; used on drop paths
    pub fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(member = %self.spec.name, error = %e, "start_kill failed");
        }
        self.pump.abort();
    }
}

fn exit_of(member: String, status: ExitStatus, forced: bool) -> MemberExit {
    MemberExit {
        member,
        code: status.code(),
        forced,
    }
}

/// Forward member stderr to tracing, keep a tail, and flag readiness
fn start_log_pump(
    member: String,
    stderr: ChildStderr,
    ready: watch::Sender<bool>,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(target: "kvprobe::member", member = %member, "{}", line);
                    if line.contains(READY_MARKER) {
                        ready.send_replace(true);
                    }
                    let mut kept = tail.lock();
                    if kept.len() == LOG_TAIL_LINES {
                        kept.pop_front();
                    }
                    kept.push_back(line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(member = %member, error = %e, "member log read error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_spec() {
        let root = Path::new("/tmp/kvprobe-test");
        let (spec, _ports) = MemberSpec::allocate(1, "127.0.0.1", root).unwrap();

        assert_eq!(spec.name, "m1");
        assert!(spec.client_url.starts_with("http://127.0.0.1:"));
        assert_ne!(spec.client_url, spec.peer_url);
        assert_eq!(spec.data_dir, root.join("m1.etcd"));
        assert_eq!(
            spec.initial_cluster_entry(),
            format!("m1={}", spec.peer_url)
        );
    }

    #[test]
    fn test_reserved_ports_stay_bound() {
        let root = Path::new("/tmp/kvprobe-test");
        let (first, first_ports) = MemberSpec::allocate(0, "127.0.0.1", root).unwrap();
        let (second, second_ports) = MemberSpec::allocate(1, "127.0.0.1", root).unwrap();

        let mut ports = first_ports.ports();
        ports.extend(second_ports.ports());
        let mut distinct = ports.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);
        assert!(first.client_url.ends_with(&format!(":{}", ports[0])));
        assert!(second.peer_url.ends_with(&format!(":{}", ports[3])));

        assert!(TcpListener::bind(("127.0.0.1", ports[0])).is_err());
        drop(first_ports);
        assert!(TcpListener::bind(("127.0.0.1", ports[0])).is_ok());
        assert!(TcpListener::bind(("127.0.0.1", ports[2])).is_err());
    }

    #[test]
    fn test_cluster_state_flag() {
        assert_eq!(ClusterState::New.as_str(), "new");
        assert_eq!(ClusterState::Existing.as_str(), "existing");
    }
}
