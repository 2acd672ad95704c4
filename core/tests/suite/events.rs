use std::sync::Arc;
use std::sync::Mutex;

use cmdwrap_core::CancellationPolicy;
use cmdwrap_core::CommandError;
use cmdwrap_core::CommandEvent;
use pretty_assertions::assert_eq;

use super::shell;

async fn collect_events(
    command: cmdwrap_core::Command,
) -> (Vec<CommandEvent>, Option<CommandError>) {
    let mut stream = command.events(CancellationPolicy::default());
    let mut events = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => events.push(event),
            Err(err) => error = Some(err),
        }
    }
    (events, error)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn started_is_first_and_exited_is_last() -> anyhow::Result<()> {
    let (events, error) = collect_events(shell("echo one")).await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    match events.first() {
        Some(CommandEvent::Started { pid }) => assert!(*pid > 0),
        other => panic!("expected Started first, got {other:?}"),
    }
    match events.last() {
        Some(CommandEvent::Exited { exit_code }) => assert_eq!(*exit_code, 0),
        other => panic!("expected Exited last, got {other:?}"),
    }
    let started = events
        .iter()
        .filter(|e| matches!(e, CommandEvent::Started { .. }))
        .count();
    let exited = events
        .iter()
        .filter(|e| matches!(e, CommandEvent::Exited { .. }))
        .count();
    assert_eq!((started, exited), (1, 1));
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_break_contract_holds_end_to_end() -> anyhow::Result<()> {
    let (events, error) = collect_events(shell("printf 'Foo\\r\\rBar\\n\\nBaz'")).await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    let lines: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            CommandEvent::StdoutLine { line } => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["Foo", "", "Bar", "", "Baz"]);
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_lines_are_tagged_separately() -> anyhow::Result<()> {
    let (events, error) =
        collect_events(shell("echo to_out; echo to_err 1>&2")).await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    assert!(events.iter().any(
        |event| matches!(event, CommandEvent::StdoutLine { line } if line.contains("to_out"))
    ));
    assert!(events.iter().any(
        |event| matches!(event, CommandEvent::StderrLine { line } if line.contains("to_err"))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_validation_still_emits_exited_then_the_error() -> anyhow::Result<()> {
    let (events, error) = collect_events(shell("exit 7")).await;

    match events.last() {
        Some(CommandEvent::Exited { exit_code }) => assert_eq!(*exit_code, 7),
        other => panic!("expected Exited last, got {other:?}"),
    }
    match error {
        Some(CommandError::NonZeroExitCode { exit_code, .. }) => assert_eq!(exit_code, 7),
        other => panic!("expected NonZeroExitCode after the sequence, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_reaches_the_consumer_without_events() -> anyhow::Result<()> {
    let missing = if cfg!(windows) {
        "cmdwrap_no_such_program.exe"
    } else {
        "/cmdwrap/no/such/program"
    };
    let (events, error) = collect_events(cmdwrap_core::Command::new(missing)).await;

    assert!(events.is_empty(), "no events expected, got {events:?}");
    assert!(
        matches!(error, Some(CommandError::SpawnFailed { .. })),
        "expected SpawnFailed, got {error:?}"
    );
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_observation_sees_the_same_lines_as_pull() -> anyhow::Result<()> {
    let command = shell("printf 'a\\nb\\nc\\n'");

    let (pull_events, pull_error) = collect_events(command.clone()).await;
    assert!(pull_error.is_none());

    let pushed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&pushed);
    let result = command
        .observe(CancellationPolicy::default(), move |event| {
            sink.lock().unwrap().push(event);
        })
        .await?;
    assert!(result.success());

    let lines = |events: &[CommandEvent]| -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                CommandEvent::StdoutLine { line } => Some(line.clone()),
                _ => None,
            })
            .collect()
    };
    assert_eq!(lines(&pushed.lock().unwrap()), lines(&pull_events));
    assert_eq!(lines(&pull_events), vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_adapter_yields_the_same_sequence() -> anyhow::Result<()> {
    use futures::StreamExt;

    let items: Vec<_> = shell("echo streamed")
        .events(CancellationPolicy::default())
        .into_stream()
        .collect()
        .await;

    assert!(items.iter().all(Result::is_ok));
    assert!(items.len() >= 3, "expected Started/line/Exited, got {items:?}");
    Ok(())
}
