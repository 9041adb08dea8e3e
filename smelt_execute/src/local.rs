use std::io;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use smelt_events::CommandEventVariant;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::profiler::Profiler;
use crate::script;
use crate::{ExecutionHandle, ExecutionOutcome, ExecutionRequest, ExecutionStatus, Executor};

/// Grace period between SIGTERM and SIGKILL when a command is cancelled or times out.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Runs a command as a bare subprocess on the local machine.
pub struct Local {
    pub sampling_period: Option<Duration>,
}

impl Default for Local {
    fn default() -> Self {
        Local { sampling_period: None }
    }
}

#[async_trait]
impl Executor for Local {
    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionHandle> {
        let materialized = script::materialize(&request.working_dir, &request.command_ref, &request.script)?;

        let mut cmd = Command::new(&materialized.script_path);
        cmd.current_dir(&request.working_dir);
        cmd.envs(&request.env);
        cmd.env("SMELT_ROOT", &request.smelt_root);
        cmd.env("TARGET_ROOT", format!("{}/smelt-out/{}", request.smelt_root, request.command_ref));
        let cmd = prepare_command(cmd);

        let mut child = spawn_retry_txt_busy(cmd, || tokio::time::sleep(Duration::from_millis(50)))
            .await
            .context("failed to start command")?;

        let stdout = child.stdout.take().context("child stdout is not piped")?;
        let stdout_path = materialized.stdout_path.clone();
        let timeout = Duration::from_secs(request.runtime.timeout);
        let cancellation = request.cancellation.clone();
        let sampling_period = self.sampling_period;

        let (tx, rx) = mpsc::unbounded_channel();
        let result = tokio::spawn(run_to_completion(
            child,
            stdout,
            stdout_path,
            timeout,
            cancellation,
            sampling_period,
            tx,
        ));

        Ok(ExecutionHandle { events: rx, result })
    }
}

async fn run_to_completion(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    stdout_path: std::path::PathBuf,
    timeout: Duration,
    cancellation: tokio_util::sync::CancellationToken,
    sampling_period: Option<Duration>,
    tx: mpsc::UnboundedSender<CommandEventVariant>,
) -> anyhow::Result<ExecutionOutcome> {
    let pid = child.id();

    let profiler_handle = pid.map(|pid| {
        let tx = tx.clone();
        let period = sampling_period.unwrap_or(Duration::from_millis(500));
        tokio::spawn(Profiler::new(pid, period).run(tx))
    });

    let mut captured = Vec::new();
    let mut file = tokio::fs::File::create(&stdout_path).await.ok();
    let mut frames = FramedRead::new(stdout, BytesCodec::new());

    let status = loop {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => {
                terminate_then_kill(&child).await;
                break ExecutionStatus::Cancelled;
            }
            _ = tokio::time::sleep(timeout) => {
                terminate_then_kill(&child).await;
                break ExecutionStatus::TimedOut;
            }
            chunk = frames.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let bytes: Bytes = bytes.freeze();
                        if let Some(file) = file.as_mut() {
                            let _ = file.write_all(&bytes).await;
                        }
                        captured.extend_from_slice(&bytes);
                        let _ = tx.send(CommandEventVariant::Stdout(bytes));
                    }
                    Some(Err(_)) | None => {
                        let exit = child.wait().await?;
                        break ExecutionStatus::Finished { exit_code: exit.code().unwrap_or(-1) };
                    }
                }
            }
        }
    };

    if let Some(handle) = profiler_handle {
        handle.abort();
    }

    Ok(ExecutionOutcome { status, stdout: captured })
}

async fn terminate_then_kill(child: &Child) {
    let Some(pid) = child.id() else { return };
    if let Err(e) = signal_process(pid, Signal::Term) {
        tracing::warn!(pid, error = %e, "failed to send SIGTERM");
    }
    tokio::time::sleep(KILL_GRACE).await;
    if let Err(e) = signal_process(pid, Signal::Kill) {
        tracing::warn!(pid, error = %e, "failed to send SIGKILL");
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_process(pid: u32, signal: Signal) -> anyhow::Result<()> {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let pid: i32 = pid.try_into().context("pid does not fit an i32")?;
    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    match signal::killpg(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        // The process group is already gone; nothing left to kill.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to signal process group {pid}")),
    }
}

#[cfg(not(unix))]
fn signal_process(pid: u32, _signal: Signal) -> anyhow::Result<()> {
    tracing::warn!(pid, "process-group signalling is unix-only; relying on process drop");
    Ok(())
}

fn prepare_command(mut cmd: Command) -> Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
    cmd
}

/// See `app/buck2_forkserver`'s `spawn_retry_txt_busy`: fork-exec in a busy process can
/// transiently fail with ETXTBUSY when another thread still holds the script open for writing.
/// Retrying a handful of times clears it up without needing a dedicated fork server.
async fn spawn_retry_txt_busy<F, D>(mut cmd: Command, mut delay: F) -> io::Result<Child>
where
    F: FnMut() -> D,
    D: std::future::Future<Output = ()>,
{
    let mut attempts = 10;
    loop {
        let res = cmd.spawn();
        let is_txt_busy = matches!(res.as_ref().map_err(|e| e.raw_os_error()), Err(Some(libc::ETXTBSY)));
        if attempts == 0 || !is_txt_busy {
            return res;
        }
        delay().await;
        attempts -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smelt_types::RuntimeRequirements;
    use std::collections::HashMap;

    fn request(script: Vec<&str>, timeout: u64, dir: &std::path::Path) -> ExecutionRequest {
        ExecutionRequest {
            command_ref: "//tests:smoke".to_owned(),
            script: script.into_iter().map(str::to_owned).collect(),
            working_dir: dir.to_path_buf(),
            env: HashMap::new(),
            smelt_root: dir.display().to_string(),
            runtime: RuntimeRequirements {
                timeout,
                ..RuntimeRequirements::default()
            },
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn runs_a_command_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Local::default().execute(request(vec!["echo hello"], 10, dir.path())).await.unwrap();
        let outcome = handle.result.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Finished { exit_code: 0 });
        assert_eq!(String::from_utf8(outcome.stdout).unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn smelt_root_and_target_root_are_visible_to_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Local::default()
            .execute(request(vec!["echo $SMELT_ROOT $TARGET_ROOT"], 10, dir.path()))
            .await
            .unwrap();
        let outcome = handle.result.await.unwrap().unwrap();
        let expected = format!("{} {}/smelt-out/{}", dir.path().display(), dir.path().display(), "//tests:smoke");
        assert_eq!(String::from_utf8(outcome.stdout).unwrap().trim(), expected);
    }

    #[tokio::test]
    async fn a_failing_command_reports_its_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Local::default().execute(request(vec!["exit 3"], 10, dir.path())).await.unwrap();
        let outcome = handle.result.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Finished { exit_code: 3 });
    }

    #[tokio::test]
    async fn a_command_that_outlives_its_timeout_is_reported_as_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Local::default()
            .execute(request(vec!["sleep 10"], 1, dir.path()))
            .await
            .unwrap();
        let outcome = handle.result.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_token_stops_the_command_early() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(vec!["sleep 10"], 60, dir.path());
        let token = request.cancellation.clone();
        let handle = Local::default().execute(request).await.unwrap();
        token.cancel();
        let outcome = handle.result.await.unwrap().unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    }
}
