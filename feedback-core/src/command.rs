// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Shell commands run on behalf of a session.
//!
//! A command runs in its own pump task which owns the child. Output lines are
//! forwarded as `command_output` frames; the exit is reported through the
//! `on_exit` hook. On unix the shell leads its own process group, so
//! terminating signals everything the command forked: SIGTERM to the group,
//! a grace period, then SIGKILL to the group and a kill of the child.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::OutboundMessage;

/// Receives every frame produced by a command.
pub type OutputSink = Arc<dyn Fn(OutboundMessage) + Send + Sync>;

/// Drain time for output that is still buffered after the child exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// How the child ended when it was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

pub struct RunningCommand {
    command: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for RunningCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningCommand")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .finish()
    }
}

fn shell(command: &str) -> Command {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).process_group(0);
        cmd
    };

    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn forward_lines<R>(reader: R, sink: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink(OutboundMessage::CommandOutput { output: line });
        }
    })
}

impl RunningCommand {
    /// Spawn `command` through the platform shell.
    pub fn spawn<E>(command: &str, cwd: Option<&Path>, sink: OutputSink, on_exit: E) -> Result<Self>
    where
        E: FnOnce(Option<i32>) + Send + 'static,
    {
        let mut cmd = shell(command);
        if let Some(dir) = cwd.filter(|dir| dir.is_dir()) {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(command, ?pid, "Spawned command");

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, sink));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let pump = tokio::spawn(async move {
            // A dropped sender counts as a kill request.
            let exit_code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(error = %e, "Failed to wait for command");
                        None
                    }
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill command");
                    }
                    None
                }
            };
            for mut forwarder in forwarders {
                if tokio::time::timeout(OUTPUT_DRAIN, &mut forwarder).await.is_err() {
                    forwarder.abort();
                }
            }
            on_exit(exit_code);
        });

        Ok(Self {
            command: command.to_string(),
            pid,
            kill_tx: Some(kill_tx),
            pump,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.pump.is_finished()
    }

    /// SIGTERM to the process group, then a forced kill once `grace` has
    /// elapsed. Processes the command left in the background are signalled
    /// even when the shell itself already exited.
    pub async fn terminate(mut self, grace: Duration) -> Result<Termination> {
        let signalled = self.signal_group(Signal::Term);
        if let Err(e) = &signalled {
            warn!(pid = ?self.pid, error = %e, "Failed to signal process group");
        }
        let exited = self.pump.is_finished()
            || (signalled.is_ok() && tokio::time::timeout(grace, &mut self.pump).await.is_ok());
        if exited {
            // Members of the group that outlived the shell.
            self.signal_group(Signal::Kill)?;
            return Ok(Termination::Graceful);
        }

        warn!(command = %self.command, pid = ?self.pid, "Command ignored SIGTERM, killing");
        if let Err(e) = self.signal_group(Signal::Kill) {
            warn!(pid = ?self.pid, error = %e, "Failed to kill process group");
        }
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Err(e) = (&mut self.pump).await {
            warn!(error = %e, "Command pump task failed");
        }
        Ok(Termination::Forced)
    }

    /// Signal the group led by the shell. A group that is already gone is
    /// not an error.
    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) -> Result<()> {
        use nix::sys::signal::{killpg, Signal as NixSignal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _signal: Signal) -> Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
    use tokio::sync::mpsc;

    fn line_sink() -> (OutputSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: OutputSink = Arc::new(move |message| {
            if let OutboundMessage::CommandOutput { output } = message {
                let _ = tx.send(output);
            }
        });
        (sink, rx)
    }

    async fn next_line(lines: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("no output in time")
            .expect("output closed")
    }

    /// Alive and not a zombie waiting to be reaped.
    pub(crate) fn is_running(pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }

    pub(crate) async fn assert_gone(pid: u32) {
        for _ in 0..40 {
            if !is_running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {pid} outlived the command");
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let (sink, mut lines) = line_sink();
        let (exit_tx, exit_rx) = oneshot::channel();
        let _running = RunningCommand::spawn("echo hello; exit 3", None, sink, move |code| {
            let _ = exit_tx.send(code);
        })
        .unwrap();

        assert_eq!(exit_rx.await.unwrap(), Some(3));
        assert_eq!(next_line(&mut lines).await, "hello");
    }

    #[tokio::test]
    async fn test_terminate_long_running() {
        let (sink, _lines) = line_sink();
        let running = RunningCommand::spawn("sleep 30", None, sink, |_| {}).unwrap();
        let termination = running.terminate(Duration::from_secs(3)).await.unwrap();
        assert_eq!(termination, Termination::Graceful);
    }

    #[tokio::test]
    async fn test_forced_kill_when_sigterm_ignored() {
        let (sink, mut lines) = line_sink();
        let running =
            RunningCommand::spawn("trap '' TERM; echo ready; sleep 30", None, sink, |_| {})
                .unwrap();
        // The trap is installed once the shell has printed.
        assert_eq!(next_line(&mut lines).await, "ready");
        let termination = running.terminate(Duration::from_millis(300)).await.unwrap();
        assert_eq!(termination, Termination::Forced);
    }

    #[tokio::test]
    async fn test_terminate_reaches_background_children() {
        let (sink, mut lines) = line_sink();
        let running =
            RunningCommand::spawn("sleep 4343 & echo $!; wait", None, sink, |_| {}).unwrap();
        let child: u32 = next_line(&mut lines).await.parse().unwrap();
        assert!(is_running(child));

        let termination = running.terminate(Duration::from_secs(3)).await.unwrap();
        assert_eq!(termination, Termination::Graceful);
        assert_gone(child).await;
    }

    #[tokio::test]
    async fn test_forced_kill_reaches_background_children() {
        let (sink, mut lines) = line_sink();
        let running = RunningCommand::spawn(
            "trap '' TERM; sleep 4344 & echo $!; wait",
            None,
            sink,
            |_| {},
        )
        .unwrap();
        let child: u32 = next_line(&mut lines).await.parse().unwrap();

        let termination = running.terminate(Duration::from_millis(300)).await.unwrap();
        assert_eq!(termination, Termination::Forced);
        assert_gone(child).await;
    }
}
