//! End-to-end session tests: real children under real PTYs, driven
//! through the registry the way the transports drive it.

use std::path::PathBuf;
use std::time::Duration;

use coterm::assistant::AssistantCatalog;
use coterm::protocol::TermSize;
use coterm::session::{Session, SessionRegistry};

/// Write an executable script and return a command line that runs it.
fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    format!("sh {}", path.display())
}

fn registry_for(command: &str, restart: &str, ttl: Duration) -> std::sync::Arc<SessionRegistry> {
    let catalog = AssistantCatalog::detect(Some((command.to_string(), restart.to_string())));
    SessionRegistry::new(catalog, ttl, None, PathBuf::from("uploads"))
}

/// Poll the session snapshot until it contains `needle` or the deadline
/// passes.
async fn wait_for_screen(session: &Session, needle: &str, max_wait: Duration) -> String {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        let screen = String::from_utf8_lossy(&session.snapshot()).to_string();
        if screen.contains(needle) || tokio::time::Instant::now() >= deadline {
            return screen;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn banner_reaches_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "banner.sh", "echo session-banner\nexec sleep 30\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_secs(3600));

    let (session, was_new) = registry.lookup_or_create("s1", "custom").await.unwrap();
    assert!(was_new);
    Session::spawn_output_pump(session.clone());

    let screen = wait_for_screen(&session, "session-banner", Duration::from_secs(5)).await;
    assert!(screen.contains("session-banner"), "screen was: {screen:?}");

    session.close().await;
}

#[tokio::test]
async fn second_lookup_reuses_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "idle.sh", "exec sleep 30\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_secs(3600));

    let (first, was_new) = registry.lookup_or_create("s2", "custom").await.unwrap();
    assert!(was_new);
    let (second, was_new) = registry.lookup_or_create("s2", "custom").await.unwrap();
    assert!(!was_new);
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(registry.session_count().await, 1);

    first.close().await;
}

#[tokio::test]
async fn unknown_assistant_is_rejected() {
    let registry = registry_for("sleep 30", "sleep 30", Duration::from_secs(3600));
    let err = registry.lookup_or_create("s3", "clippy").await.unwrap_err();
    assert!(err.to_string().contains("unknown assistant"));
    assert_eq!(registry.session_count().await, 0);
}

#[tokio::test]
async fn input_round_trips_through_the_pty() {
    let registry = registry_for("cat", "cat", Duration::from_secs(3600));
    let (session, _) = registry.lookup_or_create("s4", "custom").await.unwrap();
    Session::spawn_output_pump(session.clone());

    session.write_input(b"hello-cat\n").await.unwrap();
    let screen = wait_for_screen(&session, "hello-cat", Duration::from_secs(5)).await;
    assert!(screen.contains("hello-cat"), "screen was: {screen:?}");

    session.close().await;
}

#[tokio::test]
async fn polling_clients_drive_size_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "idle.sh", "exec sleep 30\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_secs(3600));
    let (session, _) = registry.lookup_or_create("s5", "custom").await.unwrap();

    session
        .touch_polling("narrow", Some(TermSize { rows: 20, cols: 60 }))
        .await;
    session
        .touch_polling("wide", Some(TermSize { rows: 24, cols: 80 }))
        .await;

    let (viewers, size) = session.status().await;
    assert_eq!(viewers, 2);
    assert_eq!(size, TermSize { rows: 20, cols: 60 });

    // Everyone stops polling; the next sweep restores the default size.
    session.evict_stale_pollers(Duration::ZERO).await;
    let (viewers, size) = session.status().await;
    assert_eq!(viewers, 0);
    assert_eq!(size, TermSize::DEFAULT);

    session.close().await;
}

#[tokio::test]
async fn clean_exit_is_announced_and_final() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "ok.sh", "echo done\nexit 0\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_secs(3600));

    let (session, _) = registry.lookup_or_create("s6", "custom").await.unwrap();
    session.touch_polling("watcher", None).await;
    Session::spawn_output_pump(session.clone());

    let screen =
        wait_for_screen(&session, "[Process exited successfully]", Duration::from_secs(5)).await;
    assert!(
        screen.contains("[Process exited successfully]"),
        "screen was: {screen:?}"
    );

    session.close().await;
}

#[tokio::test]
async fn crash_restarts_with_the_resume_command() {
    let dir = tempfile::tempdir().unwrap();
    let crash = script(&dir, "crash.sh", "exit 2\n");
    let resume = script(&dir, "resume.sh", "echo resumed-after-crash\nexec sleep 30\n");
    let registry = registry_for(&crash, &resume, Duration::from_secs(3600));

    let (session, _) = registry.lookup_or_create("s7", "custom").await.unwrap();
    // A client has to be attached for the restart policy to fire.
    session.touch_polling("watcher", None).await;
    Session::spawn_output_pump(session.clone());

    let screen = wait_for_screen(&session, "resumed-after-crash", Duration::from_secs(8)).await;
    assert!(
        screen.contains("[Process exited with code 2, restarting...]"),
        "screen was: {screen:?}"
    );
    assert!(screen.contains("resumed-after-crash"), "screen was: {screen:?}");

    session.close().await;
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "idle.sh", "exec sleep 30\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_millis(10));

    registry.lookup_or_create("s8", "custom").await.unwrap();
    assert_eq!(registry.session_count().await, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.reap_once().await;
    assert_eq!(registry.session_count().await, 0);
}

#[tokio::test]
async fn attached_clients_block_reaping() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = script(&dir, "idle.sh", "exec sleep 30\n");
    let registry = registry_for(&cmd, &cmd, Duration::from_millis(10));

    let (session, _) = registry.lookup_or_create("s9", "custom").await.unwrap();
    session.touch_polling("keeper", None).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.reap_once().await;
    // The polling client is fresh, so the session must survive.
    assert_eq!(registry.session_count().await, 1);

    registry.close_all().await;
}
