#![cfg(unix)]

use cmdwrap_core::CancellationPolicy;
use cmdwrap_core::CommandEvent;
use cmdwrap_core::MemoryBuffer;
use cmdwrap_core::PipeTarget;
use cmdwrap_core::PtyOptions;
use pretty_assertions::assert_eq;

use super::shell;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_is_merged_into_stdout_under_a_pty() -> anyhow::Result<()> {
    let stdout = MemoryBuffer::new();
    let stderr = MemoryBuffer::new();

    let result = shell("echo written_to_stderr 1>&2")
        .pty(PtyOptions::default())
        .stdout(PipeTarget::to_buffer(&stdout))
        .stderr(PipeTarget::to_buffer(&stderr))
        .execute(CancellationPolicy::default())
        .await?;

    assert!(result.success());
    let merged = String::from_utf8_lossy(&stdout.contents()).into_owned();
    assert!(
        merged.contains("written_to_stderr"),
        "stderr bytes should arrive via stdout: {merged:?}"
    );
    // The error pipe target always observes an empty stream under a PTY.
    assert_eq!(stderr.contents(), Vec::<u8>::new());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_execution_under_a_pty_captures_merged_output() -> anyhow::Result<()> {
    let result = shell("echo pty_buffered_marker")
        .pty(PtyOptions {
            columns: 120,
            rows: 40,
        })
        .execute_buffered(CancellationPolicy::default())
        .await?;

    assert!(result.success());
    assert!(
        result.stdout.contains("pty_buffered_marker"),
        "stdout mismatch: {:?}",
        result.stdout
    );
    assert_eq!(result.stderr, "");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_stream_under_a_pty_reports_only_stdout_lines() -> anyhow::Result<()> {
    let mut stream = shell("echo pty_event; echo pty_err 1>&2")
        .pty(PtyOptions::default())
        .events(CancellationPolicy::default());

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = 0usize;
    while let Some(item) = stream.next().await {
        match item? {
            CommandEvent::StdoutLine { line } => stdout_lines.push(line),
            CommandEvent::StderrLine { .. } => stderr_lines += 1,
            CommandEvent::Started { .. } | CommandEvent::Exited { .. } => {}
        }
    }

    assert!(
        stdout_lines.iter().any(|line| line.contains("pty_event")),
        "missing pty stdout line: {stdout_lines:?}"
    );
    assert!(
        stdout_lines.iter().any(|line| line.contains("pty_err")),
        "stderr content should surface as stdout lines: {stdout_lines:?}"
    );
    assert_eq!(stderr_lines, 0, "no stderr events expected under a PTY");
    Ok(())
}
