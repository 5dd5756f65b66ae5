use std::error::Error;
use std::fs;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use respawn::watch::{ChangeWatcher, ProgramId};
use respawn_test_utils::fixtures::{rewrite, touch, write_file};
use respawn_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

fn fast_watcher() -> ChangeWatcher {
    ChangeWatcher::new(Duration::from_millis(20), Duration::from_millis(50))
}

#[test]
fn wait_returns_after_a_content_change() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let file = write_file(dir.path(), "watched.bin", "v1")?;
    let mut pid = ProgramId::new();
    pid.register_file(&file, &[])?;

    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        fast_watcher().wait(&pid);
        let _ = tx.send(Instant::now());
    });

    // A touch alone must not wake the watcher.
    thread::sleep(Duration::from_millis(100));
    touch(&file)?;
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    rewrite(&file, "v2")?;
    rx.recv_timeout(Duration::from_secs(5))?;
    waiter.join().map_err(|_| "watcher thread panicked")?;
    Ok(())
}

#[test]
fn change_that_is_undone_within_the_debounce_is_ignored() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let file = write_file(dir.path(), "watched.bin", "v1")?;
    let mut pid = ProgramId::new();
    pid.register_file(&file, &[])?;

    // Delete and immediately recreate with the same bytes: an atomic save.
    let watcher = ChangeWatcher::new(Duration::from_millis(10), Duration::from_millis(200));
    fs::remove_file(&file)?;
    let restorer = {
        let file = file.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            fs::write(&file, "v1")
        })
    };

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        watcher.wait(&pid);
        let _ = tx.send(());
    });
    restorer.join().map_err(|_| "restorer panicked")??;
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    Ok(())
}

#[tokio::test]
async fn wait_async_returns_after_deletion() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let file = write_file(dir.path(), "watched.txt", "hello")?;
    let mut pid = ProgramId::new();
    pid.register_file(&file, &[])?;

    let path = file.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tokio::fs::remove_file(&path).await;
    });

    with_timeout(fast_watcher().wait_async(&pid)).await;
    assert!(pid.changed());
    Ok(())
}
