use std::time::Duration;
use std::time::Instant;

use cmdwrap_core::CancellationKind;
use cmdwrap_core::CancellationPolicy;
use cmdwrap_core::CommandError;
use tokio_util::sync::CancellationToken;

use super::shell;

/// A shell command that idles for roughly `seconds`.
fn sleep_command(seconds: u32) -> cmdwrap_core::Command {
    if cfg!(windows) {
        shell(&format!("ping -n {} 127.0.0.1 > NUL", seconds + 1))
    } else {
        shell(&format!("sleep {seconds}"))
    }
}

#[cfg(unix)]
fn process_is_gone(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return false;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

fn expect_cancelled(err: CommandError, expected: CancellationKind) -> u32 {
    match err {
        CommandError::Cancelled { kind, pid, .. } => {
            assert_eq!(kind, expected, "wrong cancellation kind reported");
            pid
        }
        other => panic!("expected Cancelled({expected:?}), got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forceful_armed_before_spawn_terminates_immediately() {
    let forceful = CancellationToken::new();
    forceful.cancel();

    let started = Instant::now();
    let err = sleep_command(5)
        .execute(CancellationPolicy::default().with_forceful(forceful))
        .await
        .expect_err("pre-armed forceful signal should cancel the run");

    let pid = expect_cancelled(err, CancellationKind::Forceful);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "cancellation took too long: {:?}",
        started.elapsed()
    );
    #[cfg(unix)]
    assert!(process_is_gone(pid), "pid {pid} should no longer be running");
    #[cfg(not(unix))]
    let _ = pid;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forceful_mid_run_kills_the_process() {
    let forceful = CancellationToken::new();
    let trigger = forceful.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = sleep_command(5)
        .execute(CancellationPolicy::default().with_forceful(forceful))
        .await
        .expect_err("mid-run forceful signal should cancel the run");

    let pid = expect_cancelled(err, CancellationKind::Forceful);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "kill should not wait for the child's natural exit"
    );
    #[cfg(unix)]
    assert!(process_is_gone(pid), "pid {pid} should no longer be running");
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_mid_run_interrupts_a_cooperative_child() {
    let graceful = CancellationToken::new();
    let trigger = graceful.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = sleep_command(5)
        .execute(CancellationPolicy::default().with_graceful(graceful))
        .await
        .expect_err("interrupt should terminate the child before its natural exit");

    let pid = expect_cancelled(err, CancellationKind::Graceful);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "interrupted child should exit promptly"
    );
    assert!(process_is_gone(pid), "pid {pid} should no longer be running");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_armed_before_spawn_is_reported() {
    let graceful = CancellationToken::new();
    graceful.cancel();

    let err = sleep_command(5)
        .execute(CancellationPolicy::default().with_graceful(graceful))
        .await
        .expect_err("pre-armed graceful signal should cancel the run");

    let pid = expect_cancelled(err, CancellationKind::Graceful);
    assert!(process_is_gone(pid), "pid {pid} should no longer be running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forceful_takes_precedence_over_graceful() {
    let graceful = CancellationToken::new();
    let forceful = CancellationToken::new();
    graceful.cancel();
    forceful.cancel();

    let err = sleep_command(5)
        .execute(
            CancellationPolicy::default()
                .with_graceful(graceful)
                .with_forceful(forceful),
        )
        .await
        .expect_err("cancellation expected");

    expect_cancelled(err, CancellationKind::Forceful);
}
