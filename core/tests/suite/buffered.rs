use cmdwrap_core::CancellationPolicy;
use cmdwrap_core::Command;
use cmdwrap_core::CommandError;
use cmdwrap_core::ExitCodeValidation;
use pretty_assertions::assert_eq;

use super::find_python;
use super::shell;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_exit_reports_success() -> anyhow::Result<()> {
    let result = shell("echo hello")
        .execute_buffered(CancellationPolicy::default())
        .await?;

    assert!(result.success());
    assert_eq!(result.exit_code(), 0);
    assert!(
        result.stdout.contains("hello"),
        "stdout mismatch: {:?}",
        result.stdout
    );
    assert!(result.result.exited_at >= result.result.started_at);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_fails_validation_with_the_exact_code() {
    let err = shell("exit 42")
        .execute_buffered(CancellationPolicy::default())
        .await
        .expect_err("validation should reject exit 42");

    match err {
        CommandError::NonZeroExitCode { exit_code, program, .. } => {
            assert_eq!(exit_code, 42);
            assert!(!program.is_empty());
        }
        other => panic!("expected NonZeroExitCode, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_validation_passes_the_code_through() -> anyhow::Result<()> {
    let result = shell("exit 42")
        .validation(ExitCodeValidation::None)
        .execute(CancellationPolicy::default())
        .await?;

    assert_eq!(result.exit_code, 42);
    assert!(!result.success());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawn_failure_names_the_missing_program() {
    let missing = if cfg!(windows) {
        "cmdwrap_no_such_program.exe"
    } else {
        "/cmdwrap/no/such/program"
    };
    let err = Command::new(missing)
        .execute(CancellationPolicy::default())
        .await
        .expect_err("spawn should fail");

    match err {
        CommandError::SpawnFailed { program, .. } => {
            assert!(
                program.to_string_lossy().contains("no_such_program")
                    || program.to_string_lossy().contains("no/such/program"),
                "unexpected program in error: {program:?}"
            );
        }
        other => panic!("expected SpawnFailed, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn env_overrides_reach_the_child() -> anyhow::Result<()> {
    let script = if cfg!(windows) {
        "echo %CMDWRAP_TEST_VAR%"
    } else {
        "echo ${CMDWRAP_TEST_VAR:-missing}"
    };
    let result = shell(script)
        .env("CMDWRAP_TEST_VAR", "from_parent")
        .execute_buffered(CancellationPolicy::default())
        .await?;

    assert!(
        result.stdout.contains("from_parent"),
        "stdout mismatch: {:?}",
        result.stdout
    );
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unset_marker_removes_an_inherited_variable() -> anyhow::Result<()> {
    if std::env::var_os("HOME").is_none() {
        eprintln!("HOME not set; skipping unset_marker_removes_an_inherited_variable");
        return Ok(());
    }

    // ${HOME-absent} substitutes only when HOME is unset, not when it is
    // empty — exactly the absent-vs-empty distinction.
    let result = shell("echo ${HOME-absent}")
        .env_remove("HOME")
        .execute_buffered(CancellationPolicy::default())
        .await?;

    assert!(
        result.stdout.contains("absent"),
        "expected HOME to be removed, got {:?}",
        result.stdout
    );
    Ok(())
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn working_directory_is_applied() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let result = shell("pwd")
        .current_dir(dir.path())
        .execute_buffered(CancellationPolicy::default())
        .await?;

    let reported = std::fs::canonicalize(result.stdout.trim())?;
    assert_eq!(reported, std::fs::canonicalize(dir.path())?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heavy_output_on_both_streams_does_not_deadlock() -> anyhow::Result<()> {
    let Some(python) = find_python() else {
        eprintln!("python not found; skipping heavy_output_on_both_streams_does_not_deadlock");
        return Ok(());
    };

    let script =
        "import sys\nfor i in range(100000): sys.stdout.write('o%d\\n' % i); sys.stderr.write('e%d\\n' % i)";
    let result = Command::new(python)
        .args(["-c", script])
        .execute_buffered(CancellationPolicy::default())
        .await?;

    assert!(result.success());
    assert_eq!(result.stdout.lines().count(), 100_000);
    assert_eq!(result.stderr.lines().count(), 100_000);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_stdin_is_released_when_the_child_exits_early() -> anyhow::Result<()> {
    if cfg!(windows) {
        eprintln!("skipping oversized_stdin test on windows");
        return Ok(());
    }

    // An infinite input source must not hang the run once the consumer is
    // gone.
    let result = shell("head -c 10 > /dev/null")
        .stdin(cmdwrap_core::PipeSource::from_reader(tokio::io::repeat(b'x')))
        .execute(CancellationPolicy::default())
        .await?;

    assert!(result.success());
    Ok(())
}
