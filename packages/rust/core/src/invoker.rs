//! Build invoker: runs the external toolchain against a patched template
//! instance and publishes the artifact it leaves behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use webapk_shared::{ArtifactInfo, PipelineConfig, Result, WebApkError};

use crate::fsutil;

/// Receiving half of a job's cancellation signal. `Some(reason)` means cancel.
pub type CancelSignal = watch::Receiver<Option<String>>;

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Published artifact under the job's output directory.
    pub artifact: PathBuf,
    pub info: ArtifactInfo,
    /// Tail of the tool's combined stdout/stderr.
    pub diagnostics: String,
    pub elapsed: Duration,
}

/// Runs the configured build tool.
#[derive(Debug, Clone)]
pub struct BuildInvoker {
    program: String,
    args: Vec<String>,
    artifact_path: PathBuf,
    artifact_name: String,
    timeout: Duration,
    diagnostics_limit: usize,
}

impl BuildInvoker {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            artifact_path: config.artifact_path.clone(),
            artifact_name: config.artifact_name.clone(),
            timeout: config.timeout,
            diagnostics_limit: config.diagnostics_limit,
        }
    }

    /// Run the build tool in `instance` and copy its artifact to `output_dir`.
    ///
    /// The process is killed if `cancel` fires or the timeout elapses, and the
    /// call fails with [`WebApkError::Cancelled`]. A non-zero exit status, or
    /// a zero status without the expected artifact, is a
    /// [`WebApkError::BuildTool`] carrying the captured output.
    #[instrument(skip_all, fields(instance = %instance.display(), program = %self.program))]
    pub async fn run(
        &self,
        instance: &Path,
        output_dir: &Path,
        cancel: &mut CancelSignal,
    ) -> Result<BuildOutcome> {
        let start = Instant::now();
        let program = self.resolve_program(instance);

        info!(args = ?self.args, "running build tool");

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .current_dir(instance)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches the wrapper's children too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            WebApkError::build_tool(
                format!("failed to spawn `{}`: {e}", program.display()),
                None,
                "",
            )
        })?;
        let pid = child.id();

        let mut stdout = OutputCapture::spawn(child.stdout.take(), self.diagnostics_limit);
        let mut stderr = OutputCapture::spawn(child.stderr.take(), self.diagnostics_limit);

        let exit = tokio::select! {
            res = child.wait() => res.map_err(|e| {
                WebApkError::build_tool(format!("failed to wait for build tool: {e}"), None, "")
            }),
            _ = tokio::time::sleep(self.timeout) => {
                error!(timeout = ?self.timeout, "build tool timed out");
                Err(WebApkError::cancelled(format!("timeout after {:?}", self.timeout)))
            }
            reason = cancelled(cancel) => {
                info!(%reason, "build cancelled");
                Err(WebApkError::cancelled(reason))
            }
        };

        let status = match exit {
            Ok(status) => status,
            Err(err) => {
                kill_process_group(pid).await;
                return Err(err);
            }
        };

        // Leftover background processes may keep the pipes open past exit.
        let stdout = stdout.finish(OUTPUT_GRACE).await;
        let stderr = stderr.finish(OUTPUT_GRACE).await;
        let diagnostics = self.diagnostics(&stdout, &stderr);

        if !status.success() {
            return Err(WebApkError::build_tool(
                format!("`{}` exited with {}", self.program, status),
                status.code(),
                diagnostics,
            ));
        }

        let produced = instance.join(&self.artifact_path);
        if !produced.is_file() {
            return Err(WebApkError::build_tool(
                format!(
                    "build succeeded but no artifact at {}",
                    self.artifact_path.display()
                ),
                status.code(),
                diagnostics,
            ));
        }

        let artifact = output_dir.join(&self.artifact_name);
        let size_bytes = fsutil::copy_file_atomic(&produced, &artifact)?;
        let sha256 = fsutil::sha256_file(&artifact)?;

        let elapsed = start.elapsed();
        info!(
            artifact = %artifact.display(),
            size_bytes,
            elapsed_ms = elapsed.as_millis(),
            "build artifact published"
        );

        Ok(BuildOutcome {
            artifact,
            info: ArtifactInfo {
                file_name: self.artifact_name.clone(),
                sha256,
                size_bytes,
            },
            diagnostics,
            elapsed,
        })
    }

    /// Relative paths with a separator (`./gradlew`) are taken relative to the
    /// instance; bare names go through `PATH`.
    fn resolve_program(&self, instance: &Path) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            instance.join(program)
        } else {
            program.to_path_buf()
        }
    }

    /// Combined output, trimmed to the last `diagnostics_limit` bytes.
    fn diagnostics(&self, stdout: &[u8], stderr: &[u8]) -> String {
        let mut text = String::from_utf8_lossy(stdout).into_owned();
        let err = String::from_utf8_lossy(stderr);
        if !err.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&err);
        }
        debug!(bytes = text.len(), "captured build output");
        tail(&text, self.diagnostics_limit).to_string()
    }
}

/// How long output readers may keep draining after the tool has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Drains one output pipe into a buffer holding at most `limit` trailing bytes.
struct OutputCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let sink = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
                            out.extend_from_slice(&chunk[..n]);
                            if out.len() > limit {
                                let excess = out.len() - limit;
                                out.drain(..excess);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait up to `grace` for the pipe to close, then stop reading.
    async fn finish(&mut self, grace: Duration) -> Vec<u8> {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
                debug!("build output still held open after exit, reader stopped");
            }
        }
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// SIGKILL the whole process group led by `pid`.
#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let res = Command::new("kill")
        .args(["-9", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match res {
        Ok(status) if status.success() => debug!(pid, "build process group killed"),
        Ok(_) => debug!(pid, "build process group already gone"),
        Err(e) => warn!(pid, error = %e, "failed to signal build process group"),
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>) {}

/// Last `limit` bytes of `text`, moved forward to a char boundary.
fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Resolves with the reason once a cancellation has been requested. Never
/// resolves if the sender is gone without cancelling.
pub async fn cancelled(signal: &mut CancelSignal) -> String {
    loop {
        if let Some(reason) = signal.borrow_and_update().clone() {
            return reason;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Non-blocking check between stages.
pub fn check_cancelled(signal: &CancelSignal) -> Result<()> {
    match signal.borrow().as_ref() {
        Some(reason) => Err(WebApkError::cancelled(reason.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BUILD_OK, pipeline_config, temp_dir, write_template};

    fn invoker(root: &Path, script: &str) -> BuildInvoker {
        BuildInvoker::new(&pipeline_config(root, script))
    }

    fn instance(root: &Path) -> PathBuf {
        let dir = root.join("instance");
        write_template(&dir);
        dir
    }

    #[tokio::test]
    async fn success_publishes_artifact() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let out = tmp.join("out");
        let (_tx, mut rx) = watch::channel(None);

        let outcome = invoker(&tmp, BUILD_OK).run(&inst, &out, &mut rx).await.unwrap();

        assert_eq!(outcome.artifact, out.join("app-debug.apk"));
        assert!(outcome.artifact.is_file());
        assert_eq!(outcome.info.file_name, "app-debug.apk");
        assert_eq!(outcome.info.sha256.len(), 64);
        assert!(outcome.info.size_bytes > 0);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_diagnostics() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let (_tx, mut rx) = watch::channel(None);

        let err = invoker(&tmp, "echo compiling; echo 'FAILURE: broken' >&2; exit 3")
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap_err();

        match err {
            WebApkError::BuildTool {
                exit_code,
                diagnostics,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(diagnostics.contains("compiling"));
                assert!(diagnostics.contains("FAILURE: broken"));
            }
            other => panic!("expected BuildTool, got {other}"),
        }
        assert!(!tmp.join("out/app-debug.apk").exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn zero_exit_without_artifact_is_a_build_tool_error() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let (_tx, mut rx) = watch::channel(None);

        let err = invoker(&tmp, "echo BUILD SUCCESSFUL")
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, WebApkError::BuildTool { exit_code: Some(0), .. }));
        assert!(err.to_string().contains("no artifact"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn missing_program_is_a_build_tool_error() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let mut config = pipeline_config(&tmp, "");
        config.program = "./gradlew".into();
        config.args = vec!["assembleDebug".into()];
        let (_tx, mut rx) = watch::channel(None);

        let err = BuildInvoker::new(&config)
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, WebApkError::BuildTool { exit_code: None, .. }));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn cancel_kills_the_build() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let (tx, mut rx) = watch::channel(None);

        let inv = invoker(&tmp, "exec sleep 30");
        let out = tmp.join("out");
        let handle = tokio::spawn(async move { inv.run(&inst, &out, &mut rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Some("user request".into())).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel should stop the build promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WebApkError::Cancelled { ref reason } if reason == "user request"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn timeout_cancels_the_build() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let mut config = pipeline_config(&tmp, "exec sleep 30");
        config.timeout = Duration::from_millis(200);
        let (_tx, mut rx) = watch::channel(None);

        let err = BuildInvoker::new(&config)
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn lingering_background_process_does_not_stall_success() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let mut config = pipeline_config(&tmp, &format!("{BUILD_OK}; sleep 5 &"));
        config.timeout = Duration::from_secs(3);
        let (_tx, mut rx) = watch::channel(None);

        let started = Instant::now();
        let outcome = BuildInvoker::new(&config)
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap();

        assert!(outcome.artifact.is_file());
        assert!(started.elapsed() < Duration::from_secs(3));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn captured_output_is_bounded() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let mut config = pipeline_config(
            &tmp,
            "i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done; \
             echo FAILURE-at-end >&2; exit 1",
        );
        config.diagnostics_limit = 64;
        let (_tx, mut rx) = watch::channel(None);

        let err = BuildInvoker::new(&config)
            .run(&inst, &tmp.join("out"), &mut rx)
            .await
            .unwrap_err();

        match err {
            WebApkError::BuildTool { diagnostics, .. } => {
                assert!(diagnostics.len() <= 64, "kept {} bytes", diagnostics.len());
                assert!(diagnostics.contains("FAILURE-at-end"));
                assert!(!diagnostics.contains("line-0\n"));
            }
            other => panic!("expected BuildTool, got {other}"),
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_kills_the_whole_process_group() {
        let tmp = temp_dir("invoker");
        let inst = instance(&tmp);
        let (tx, mut rx) = watch::channel(None);

        let inv = invoker(&tmp, "sleep 30 & echo $! > bg.pid; wait");
        let (run_inst, out) = (inst.clone(), tmp.join("out"));
        let handle = tokio::spawn(async move { inv.run(&run_inst, &out, &mut rx).await });

        let mut bg_pid = None;
        for _ in 0..200 {
            bg_pid = std::fs::read_to_string(inst.join("bg.pid"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if bg_pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let bg_pid = bg_pid.expect("background child should record its pid");
        assert!(process_alive(bg_pid));

        tx.send(Some("shutdown".into())).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, WebApkError::Cancelled { .. }));

        let mut alive = true;
        for _ in 0..120 {
            alive = process_alive(bg_pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!alive, "background child {bg_pid} survived cancellation");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; a cut inside it moves forward.
        assert_eq!(tail("xé", 1), "");
        assert_eq!(tail("xéy", 2), "y");
    }

    #[test]
    fn relative_program_resolves_against_instance() {
        let tmp = temp_dir("invoker");
        let mut config = pipeline_config(&tmp, "");
        config.program = "./gradlew".into();
        let inv = BuildInvoker::new(&config);
        assert_eq!(
            inv.resolve_program(Path::new("/inst")),
            PathBuf::from("/inst/./gradlew")
        );

        config.program = "sh".into();
        let inv = BuildInvoker::new(&config);
        assert_eq!(inv.resolve_program(Path::new("/inst")), PathBuf::from("sh"));

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
