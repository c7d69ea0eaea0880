//! External encoder process plumbing.
//!
//! Spawns ffmpeg with `-progress pipe:1`, turns its key/value progress blocks
//! into [`RenderProgress`] reports, drains stderr on a separate thread and
//! kills the child on cancellation.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use splice_common::clock::EtaEstimator;
use splice_common::error::{SpliceError, SpliceResult};

use crate::backend::{CancelFlag, ProgressCallback, RenderProgress};

/// Seconds without progress before a stall warning is logged.
const STALL_WARNING_SECS: u64 = 10;

/// How often the cancel flag is polled while waiting for output.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Program plus argument vector for one encoder run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Space-joined rendering for logs and reports.
    pub fn to_command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Accumulates one `-progress` block.
#[derive(Debug, Default)]
pub(crate) struct ProgressState {
    pub out_time_secs: f64,
    pub complete: bool,
}

impl ProgressState {
    pub fn update(&mut self, key: &str, value: &str) {
        match key {
            // ffmpeg reports out_time_ms in microseconds as well.
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse::<f64>() {
                    if us.is_finite() && us >= 0.0 {
                        self.out_time_secs = us / 1_000_000.0;
                    }
                }
            }
            "progress" => {
                self.complete = value == "end";
            }
            _ => {}
        }
    }
}

pub(crate) fn progress_report(
    state: &ProgressState,
    total_frames: u64,
    expected_duration_secs: f64,
    eta: &EtaEstimator,
) -> RenderProgress {
    let progress = if state.complete {
        1.0
    } else if expected_duration_secs <= 0.0 {
        0.0
    } else {
        (state.out_time_secs / expected_duration_secs).clamp(0.0, 1.0)
    };

    RenderProgress {
        progress,
        frames_rendered: (progress * total_frames as f64).round() as u64,
        total_frames,
        eta_secs: if state.complete {
            0.0
        } else {
            eta.eta_secs(progress)
        },
    }
}

/// A running encoder child process.
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    stderr_task: Option<JoinHandle<String>>,
    started: Instant,
}

impl EncoderProcess {
    /// Spawn the encoder. With `pipe_stdin` the caller streams input frames.
    pub fn spawn(command: &EncoderCommand, pipe_stdin: bool) -> SpliceResult<Self> {
        tracing::debug!(args = ?command.get_args(), "Running encoder");
        let mut cmd = Command::new(command.program());
        cmd.args(command.get_args())
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            SpliceError::resource(format!(
                "Failed to start {}: {e}",
                command.program().display()
            ))
        })?;

        tracing::info!(
            pid = child.id(),
            args_len = command.get_args().len(),
            "Encoder process started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpliceError::resource("Failed to capture encoder stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpliceError::resource("Failed to capture encoder stderr"))?;
        let stdin = child.stdin.take();

        // Drain stderr concurrently so the encoder never blocks on a full pipe.
        let stderr_task = std::thread::spawn(move || -> String {
            let mut reader = BufReader::new(stderr);
            let mut output = String::new();
            match reader.read_to_string(&mut output) {
                Ok(_) => output,
                Err(err) => format!("<failed to read encoder stderr: {err}>"),
            }
        });

        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            lines,
            stderr_task: Some(stderr_task),
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Input pipe when spawned with `pipe_stdin`.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Consume pending progress lines without blocking.
    pub(crate) fn drain_progress(&mut self, state: &mut ProgressState) {
        while let Ok(line) = self.lines.try_recv() {
            if let Some((key, value)) = line.trim().split_once('=') {
                state.update(key, value);
            }
        }
    }

    /// Follow `-progress` output until the encoder closes stdout, then wait
    /// for it to exit. Kills the child and returns `Cancelled` on cancel.
    pub fn monitor(
        mut self,
        expected_duration_secs: f64,
        total_frames: u64,
        progress: Option<&ProgressCallback>,
        cancel: &CancelFlag,
    ) -> SpliceResult<()> {
        let eta = EtaEstimator::start();
        let mut state = ProgressState::default();
        let mut last_reported = 0.0f64;
        let mut last_progress_secs = 0.0f64;
        let mut last_progress_wall = Instant::now();

        loop {
            if cancel.is_cancelled() {
                self.kill();
                return Err(SpliceError::Cancelled);
            }

            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    let Some((key, value)) = line.trim().split_once('=') else {
                        continue;
                    };
                    state.update(key, value);
                    if key != "progress" {
                        continue;
                    }
                    if state.out_time_secs > last_progress_secs + 0.001 {
                        last_progress_secs = state.out_time_secs;
                        last_progress_wall = Instant::now();
                    }
                    let mut report =
                        progress_report(&state, total_frames, expected_duration_secs, &eta);
                    report.progress = report.progress.max(last_reported);
                    last_reported = report.progress;
                    if let Some(cb) = progress {
                        cb(report);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if last_progress_wall.elapsed().as_secs() >= STALL_WARNING_SECS {
                tracing::warn!(
                    out_time_secs = state.out_time_secs,
                    elapsed_secs = self.started.elapsed().as_secs_f64(),
                    "No encoder progress advancement for 10s"
                );
                last_progress_wall = Instant::now();
            }
        }

        self.finish()
    }

    /// Close stdin, wait for exit, and map a failed exit to an encode error.
    pub fn finish(mut self) -> SpliceResult<()> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|e| SpliceError::resource(format!("Failed to wait on encoder: {e}")))?;

        let stderr_output = self
            .stderr_task
            .take()
            .and_then(|task| task.join().ok())
            .unwrap_or_else(|| "<failed to join stderr reader>".to_string());

        if !status.success() {
            return Err(SpliceError::encode(
                format!("encoder exited with {status}"),
                stderr_tail(&stderr_output),
            ));
        }

        tracing::info!(
            elapsed_secs = self.started.elapsed().as_secs_f64(),
            "Encoder process finished"
        );
        Ok(())
    }

    /// Terminate the child. Safe to call more than once.
    pub fn kill(&mut self) {
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            tracing::info!(pid = self.child.id(), "Killing encoder process");
            self.child.kill().ok();
        }
        self.child.wait().ok();
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

/// Last lines of encoder stderr.
pub(crate) fn stderr_tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Read the container duration of a finished file.
pub fn probe_duration(ffprobe: &Path, path: &Path) -> Option<f64> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8(output.stdout)
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_state_parses_out_time() {
        let mut state = ProgressState::default();
        state.update("out_time_us", "1500000");
        assert!((state.out_time_secs - 1.5).abs() < 1e-9);
        state.update("out_time_ms", "2000000");
        assert!((state.out_time_secs - 2.0).abs() < 1e-9);
        state.update("out_time_us", "N/A");
        assert!((state.out_time_secs - 2.0).abs() < 1e-9);
        state.update("progress", "continue");
        assert!(!state.complete);
        state.update("progress", "end");
        assert!(state.complete);
    }

    #[test]
    fn test_progress_report_normalizes_against_duration() {
        let eta = EtaEstimator::start();
        let state = ProgressState {
            out_time_secs: 2.5,
            complete: false,
        };
        let report = progress_report(&state, 300, 10.0, &eta);
        assert!((report.progress - 0.25).abs() < 1e-9);
        assert_eq!(report.frames_rendered, 75);

        let overshoot = ProgressState {
            out_time_secs: 12.0,
            complete: false,
        };
        assert_eq!(progress_report(&overshoot, 300, 10.0, &eta).progress, 1.0);

        let done = ProgressState {
            out_time_secs: 0.0,
            complete: true,
        };
        let report = progress_report(&done, 300, 10.0, &eta);
        assert_eq!(report.progress, 1.0);
        assert_eq!(report.eta_secs, 0.0);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let output: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&output);
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line 99"));
    }

    #[test]
    fn test_command_line_rendering() {
        let mut command = EncoderCommand::new("ffmpeg");
        command.arg("-y").args(["-i", "in.mp4"]);
        assert_eq!(command.to_command_line(), "ffmpeg -y -i in.mp4");
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_process_reports_encode_error() {
        let mut command = EncoderCommand::new("sh");
        command.args(["-c", "echo 'bad option' >&2; exit 3"]);
        let process = EncoderProcess::spawn(&command, false).unwrap();
        let err = process
            .monitor(1.0, 30, None, &CancelFlag::new())
            .unwrap_err();
        match err {
            SpliceError::Encode { diagnostics, .. } => assert_eq!(diagnostics, "bad option"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_kills_running_process() {
        let mut command = EncoderCommand::new("sh");
        command.args(["-c", "sleep 30"]);
        let process = EncoderProcess::spawn(&command, false).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let started = Instant::now();
        let err = process.monitor(1.0, 30, None, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_progress_lines_are_reported_monotonically() {
        let mut command = EncoderCommand::new("sh");
        command.args([
            "-c",
            "printf 'out_time_us=500000\\nprogress=continue\\nout_time_us=250000\\nprogress=continue\\nprogress=end\\n'",
        ]);
        let process = EncoderProcess::spawn(&command, false).unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Box::new(move |p| sink.lock().unwrap().push(p.progress));
        process
            .monitor(1.0, 30, Some(&cb), &CancelFlag::new())
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![0.5, 0.5, 1.0]);
    }
}
