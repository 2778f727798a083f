//! Media source process supervision
//!
//! Launches one external transcoding process per session, configured to loop
//! its input file forever and emit an RTP elementary stream at the session's
//! local receive port. The process is owned by a supervise task wired to the
//! session's cancellation token: cancellation force-kills the child rather
//! than asking it to exit, because the producer does not react to
//! signal-only cancellation.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::{Error, Result};

/// Supervisor for one session's media source process
pub struct MediaSource;

impl MediaSource {
    /// Spawn the producer for a session and supervise it until cancellation
    ///
    /// The child's stderr is drained line-by-line into the log (non-fatal if
    /// the pipe is unavailable). Spawn failure aborts session setup; a later
    /// exit of the process is logged and leaves the session streaming
    /// nothing, which the pump observes as an idle socket.
    ///
    /// Returns the supervise task's handle; it resolves only once the child
    /// is confirmed dead, so callers can sequence resource release after it.
    pub fn spawn(
        config: &SourceConfig,
        host: &str,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let args = Self::args(config, host, port);
        debug!(command = %config.command, ?args, port, "starting media source");

        let mut child = Command::new(&config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SourceError(format!("failed to start {}: {}", config.command, e))
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, port));
        }

        Ok(tokio::spawn(supervise(child, cancel, port)))
    }

    /// Build the producer argument vector for a session
    ///
    /// `-re -stream_loop -1` paces the fixed input file at native rate and
    /// loops it indefinitely; `-an` drops audio; the output is an RTP stream
    /// aimed at the session's receive socket.
    fn args(config: &SourceConfig, host: &str, port: u16) -> Vec<String> {
        vec![
            "-re".to_string(),
            "-stream_loop".to_string(),
            "-1".to_string(),
            "-i".to_string(),
            config.input.clone(),
            "-an".to_string(),
            "-c:v".to_string(),
            config.encoder.clone(),
            "-f".to_string(),
            "rtp".to_string(),
            format!("rtp://{}:{}", host, port),
        ]
    }
}

/// Run the child until it exits on its own or the session is cancelled
///
/// Termination on cancellation is unconditional (`kill`, not a polite
/// signal) and does not wait on the child's I/O; the stderr drain task ends
/// on its own when the pipe closes.
async fn supervise(mut child: Child, cancel: CancellationToken, port: u16) {
    tokio::select! {
        _ = cancel.cancelled() => {
            match child.kill().await {
                Ok(()) => debug!(port, "media source terminated"),
                Err(e) => warn!(port, error = %e, "failed to kill media source"),
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) => warn!(port, %status, "media source exited; session degrades to an empty stream"),
                Err(e) => warn!(port, error = %e, "failed to wait on media source"),
            }
        }
    }
}

/// Re-log the producer's diagnostic output until EOF
async fn drain_stderr(stderr: ChildStderr, port: u16) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "media_bridge::source::producer", port, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(port, error = %e, "media source log stream ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_carry_loop_flags_and_rtp_url() {
        let config = SourceConfig {
            command: "ffmpeg".to_string(),
            input: "loop.mp4".to_string(),
            encoder: "libx264".to_string(),
        };

        let args = MediaSource::args(&config, "127.0.0.1", 5004);
        assert_eq!(
            args,
            vec![
                "-re",
                "-stream_loop",
                "-1",
                "-i",
                "loop.mp4",
                "-an",
                "-c:v",
                "libx264",
                "-f",
                "rtp",
                "rtp://127.0.0.1:5004",
            ]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_typed() {
        let config = SourceConfig {
            command: "/nonexistent/media-producer".to_string(),
            ..SourceConfig::default()
        };

        let err = MediaSource::spawn(&config, "127.0.0.1", 5004, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::SourceError(_)));
    }

    #[tokio::test]
    async fn test_spawn_handle_resolves_when_child_exits() {
        let config = SourceConfig {
            command: "/bin/true".to_string(),
            ..SourceConfig::default()
        };

        let handle = MediaSource::spawn(&config, "127.0.0.1", 5004, CancellationToken::new())
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("supervise handle must resolve once the child is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        // With a pre-cancelled token the supervise task must kill the child
        // immediately instead of waiting out its 30s sleep.
        let cancel = CancellationToken::new();
        cancel.cancel();

        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("sleep must exist on the test host");

        let supervise = tokio::spawn(supervise(child, cancel, 5004));
        tokio::time::timeout(std::time::Duration::from_secs(5), supervise)
            .await
            .expect("supervise must return promptly after kill")
            .unwrap();
    }
}
