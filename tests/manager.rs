use std::cell::RefCell;
use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::sys::wait::WaitStatus;
use tempfile::tempdir;

use respawn::engine::Manager;
use respawn::errors::RespawnError;
use respawn::exec::{Slave, SlaveId};
use respawn::types::{SlaveReport, SpawnOptions, Subcommand};
use respawn::watch::{ProgramId, TrackedFile};
use respawn_test_utils::builders::{ConfigFileBuilder, SlaveConfigBuilder};
use respawn_test_utils::fixtures::{crash_script, report_script, rewrite, sleep_script, write_file};
use respawn_test_utils::{init_tracing, wait_until};

type TestResult = Result<(), Box<dyn Error>>;

const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll without autospawn until every slave in `ids` has been reaped.
fn reap_all(manager: &mut Manager, ids: &[SlaveId]) -> Result<(), Box<dyn Error>> {
    let mut pending: BTreeSet<SlaveId> = ids.iter().copied().collect();
    let mut failure = None;
    let done = wait_until(REAP_TIMEOUT, || match manager.poll(false) {
        Ok(outcome) => {
            for id in outcome.finished {
                pending.remove(&id);
            }
            pending.is_empty()
        }
        Err(e) => {
            failure = Some(e);
            true
        }
    });
    if let Some(e) = failure {
        return Err(e.into());
    }
    if !done {
        return Err(format!("slaves {pending:?} did not finish in time").into());
    }
    Ok(())
}

fn empty_report() -> SlaveReport {
    SlaveReport::default()
}

#[test]
fn failed_slave_is_retried_before_a_fresh_one() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1);

    let fresh_cmd = report_script(dir.path(), "fresh.sh", &empty_report(), 0)?;
    let fresh = manager.add_slave(fresh_cmd, Some("fresh".into()), SpawnOptions::default());
    let failing_cmd = crash_script(dir.path(), "crash.sh")?;
    let failing = manager.add_slave(failing_cmd, Some("failing".into()), SpawnOptions::default());

    manager.queue(failing);
    let outcome = manager.poll(false)?;
    assert_eq!(outcome.started, vec![failing]);
    reap_all(&mut manager, &[failing])?;
    assert!(!manager.slave(failing).ok_or("missing slave")?.success()?);

    manager
        .slave_mut(failing)
        .ok_or("missing slave")?
        .mark_needed();
    assert!(manager.slave(fresh).ok_or("missing slave")?.needed());

    let outcome = manager.poll(true)?;
    assert_eq!(outcome.started, vec![failing]);

    reap_all(&mut manager, &[failing])?;
    Ok(())
}

#[test]
fn active_slaves_never_exceed_parallel_level_plus_one() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(2);

    let mut ids = Vec::new();
    for i in 0..5 {
        let cmd = sleep_script(dir.path(), &format!("sleep{i}.sh"), 2)?;
        ids.push(manager.add_slave(cmd, None, SpawnOptions::default()));
    }

    let outcome = manager.poll(true)?;
    assert_eq!(outcome.started.len(), 2);
    assert_eq!(manager.active_count(), 3);

    let outcome = manager.poll(true)?;
    assert!(outcome.started.is_empty());
    assert_eq!(manager.active_count(), 3);
    assert!(manager.is_active(manager.self_id()));
    assert!(manager.self_slave().is_some_and(|s| s.is_self()));

    manager.kill_active();
    assert_eq!(manager.active_count(), 1);
    Ok(())
}

#[test]
fn queued_slaves_go_first_and_autospawn_can_be_disabled() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1);

    let a = manager.add_slave(
        report_script(dir.path(), "a.sh", &empty_report(), 0)?,
        Some("a".into()),
        SpawnOptions::default(),
    );
    let b = manager.add_slave(
        report_script(dir.path(), "b.sh", &empty_report(), 0)?,
        Some("b".into()),
        SpawnOptions::default(),
    );

    manager.queue(b);
    assert_eq!(manager.queued().collect::<Vec<_>>(), vec![b]);
    let outcome = manager.poll(false)?;
    assert_eq!(outcome.started, vec![b]);
    assert_eq!(manager.queued().count(), 0);

    reap_all(&mut manager, &[b])?;

    // `a` is needed, but nothing spawns without autospawn.
    assert!(manager.slave(a).ok_or("missing slave")?.needed());
    let outcome = manager.poll(false)?;
    assert!(outcome.started.is_empty());

    let outcome = manager.poll(true)?;
    assert_eq!(outcome.started, vec![a]);
    reap_all(&mut manager, &[a])?;
    Ok(())
}

#[test]
fn shared_file_change_fans_out_to_interested_slaves() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let shared = write_file(dir.path(), "shared.bin", "v1")?;

    let mut seed = ProgramId::new();
    seed.register_file(&shared, &[])?;
    let mut manager = Manager::with_seed(2, seed);

    let report = SlaveReport {
        subcommands: Vec::new(),
        files: vec![shared.clone()],
    };
    let s1 = manager.add_slave(
        report_script(dir.path(), "s1.sh", &report, 0)?,
        None,
        SpawnOptions::default(),
    );
    let s2 = manager.add_slave(
        report_script(dir.path(), "s2.sh", &report, 0)?,
        None,
        SpawnOptions::default(),
    );
    manager.queue(s1);
    manager.queue(s2);
    assert_eq!(manager.poll(false)?.started, vec![s1, s2]);
    reap_all(&mut manager, &[s1, s2])?;

    for id in [s1, s2] {
        assert!(!manager.slave(id).ok_or("missing slave")?.needed());
    }
    let tracked = manager.tracked_files().get(&shared).ok_or("not tracked")?;
    assert_eq!(tracked.slaves().iter().copied().collect::<Vec<_>>(), vec![s1, s2]);

    rewrite(&shared, "v2")?;
    manager.poll(false)?;

    assert!(manager.slave(s1).ok_or("missing slave")?.needed());
    assert!(manager.slave(s2).ok_or("missing slave")?.needed());
    assert!(manager.tracked_files().get(&shared).is_none());
    Ok(())
}

#[test]
fn touched_shared_file_does_not_retrigger() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let shared = write_file(dir.path(), "shared.bin", "v1")?;

    let mut seed = ProgramId::new();
    seed.register_file(&shared, &[])?;
    let mut manager = Manager::with_seed(1, seed);

    let report = SlaveReport {
        subcommands: Vec::new(),
        files: vec![shared.clone()],
    };
    let s = manager.add_slave(
        report_script(dir.path(), "s.sh", &report, 0)?,
        None,
        SpawnOptions::default(),
    );
    manager.queue(s);
    manager.poll(false)?;
    reap_all(&mut manager, &[s])?;

    respawn_test_utils::fixtures::touch(&shared)?;
    manager.poll(false)?;
    assert!(!manager.slave(s).ok_or("missing slave")?.needed());
    assert!(manager.tracked_files().contains_key(&shared));
    Ok(())
}

#[test]
fn reported_subcommands_become_slaves_once() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1);

    let added = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&added);
    manager.on_slave_new(move |slave| sink.borrow_mut().push(slave.name().map(str::to_string)));
    // Replay: the manager's own slave already exists.
    assert_eq!(added.borrow().len(), 1);

    let report = SlaveReport {
        subcommands: vec![Subcommand::new(Some("sub".into()), ["true"])],
        files: Vec::new(),
    };
    let parent = manager.add_slave(
        report_script(dir.path(), "parent.sh", &report, 0)?,
        Some("parent".into()),
        SpawnOptions::default(),
    );

    for _ in 0..2 {
        manager.queue(parent);
        manager.poll(false)?;
        reap_all(&mut manager, &[parent])?;
    }

    let subs: Vec<_> = manager.workers().filter(|s| s.name() == Some("sub")).collect();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].cmdline(), ["true".to_string()]);
    assert_eq!(
        added.borrow().as_slice(),
        &[None, Some("parent".to_string()), Some("sub".to_string())]
    );
    Ok(())
}

#[test]
fn active_or_self_slaves_cannot_be_removed() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1);

    let removed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&removed);
    manager.on_slave_removed(move |slave| sink.borrow_mut().push(slave.id()));

    let busy = manager.add_slave(
        sleep_script(dir.path(), "busy.sh", 2)?,
        None,
        SpawnOptions::default(),
    );
    let idle = manager.add_slave(["true"], None, SpawnOptions::default());
    manager.queue(busy);
    manager.poll(false)?;

    assert!(matches!(manager.remove_slave(busy), Err(RespawnError::SlaveActive(_))));
    let me = manager.self_id();
    assert!(matches!(manager.remove_slave(me), Err(RespawnError::SlaveActive(_))));

    let gone = manager.remove_slave(idle)?;
    assert_eq!(gone.id(), idle);
    assert!(manager.slave(idle).is_none());
    assert_eq!(removed.borrow().as_slice(), &[idle]);

    manager.kill_active();
    manager.remove_slave(busy)?;
    Ok(())
}

#[test]
fn start_hooks_replay_for_active_slaves() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1);
    let s = manager.add_slave(
        sleep_script(dir.path(), "s.sh", 2)?,
        None,
        SpawnOptions::default(),
    );
    manager.queue(s);
    manager.poll(false)?;

    let started = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&started);
    manager.on_slave_start(move |slave| sink.borrow_mut().push(slave.id()));

    let me = manager.self_id();
    let mut seen = started.borrow().clone();
    seen.sort();
    let mut expected = vec![me, s];
    expected.sort();
    assert_eq!(seen, expected);

    manager.kill_active();
    Ok(())
}

#[test]
fn slaves_are_seeded_with_a_copy_of_the_seed() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let seeded = write_file(dir.path(), "seed.bin", "s")?;
    let private = write_file(dir.path(), "private.bin", "p")?;

    let mut seed = ProgramId::new();
    seed.register_file(&seeded, &[])?;
    let mut manager = Manager::with_seed(1, seed);

    let a = manager.add_slave(["true"], None, SpawnOptions::default());
    let b = manager.add_slave(["true"], None, SpawnOptions::default());
    manager
        .slave_mut(a)
        .ok_or("missing slave")?
        .register_files([&private], false)?;

    let a = manager.slave(a).ok_or("missing slave")?;
    let b = manager.slave(b).ok_or("missing slave")?;
    assert!(a.program_id().contains(&seeded));
    assert!(a.program_id().contains(&private));
    assert!(b.program_id().contains(&seeded));
    assert!(!b.program_id().contains(&private));
    assert!(!manager.seed().contains(&private));
    Ok(())
}

#[test]
fn manager_from_config_declares_and_queues_slaves() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let seed_file = write_file(dir.path(), "Cargo.lock", "lock")?;

    let cfg = ConfigFileBuilder::new()
        .with_parallel_level(3)
        .with_seed(&seed_file)
        .with_slave("build", SlaveConfigBuilder::new(["make"]).queued(true).build())
        .with_slave("test", SlaveConfigBuilder::new(["make", "test"]).build())
        .build();

    let manager = Manager::from_config(&cfg)?;
    assert_eq!(manager.parallel_level(), 3);
    assert!(manager.seed().contains(&seed_file));

    let build = manager
        .workers()
        .find(|s| s.name() == Some("build"))
        .ok_or("build slave missing")?;
    assert_eq!(manager.queued().collect::<Vec<_>>(), vec![build.id()]);
    assert!(build.program_id().contains(&seed_file));
    assert_eq!(manager.workers().count(), 3);
    Ok(())
}

#[tokio::test]
async fn run_until_kills_active_slaves_on_shutdown() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let mut manager = Manager::new(1).with_poll_interval(Duration::from_millis(20));
    let s = manager.add_slave(
        sleep_script(dir.path(), "long.sh", 5)?,
        None,
        SpawnOptions::default(),
    );

    manager
        .run_until(tokio::time::sleep(Duration::from_millis(300)))
        .await?;

    let slave = manager.slave(s).ok_or("missing slave")?;
    assert!(slave.is_finished());
    assert!(matches!(slave.status(), Some(WaitStatus::Signaled(..))));
    assert_eq!(manager.active_count(), 1);
    Ok(())
}

#[test]
fn spawning_does_not_wait_for_children_to_read_their_initial_state() -> TestResult {
    init_tracing();
    let dir = tempdir()?;

    // Big enough that the snapshot would not fit in a pipe buffer.
    let mut seed = ProgramId::new();
    for i in 0..600 {
        let path = write_file(
            dir.path(),
            &format!("seed/a-reasonably-long-dependency-name-{i:04}.bin"),
            &format!("content {i}"),
        )?;
        seed.register_file(&path, &[])?;
    }
    let mut manager = Manager::with_seed(2, seed);
    for i in 0..2 {
        let cmd = sleep_script(dir.path(), &format!("quiet{i}.sh"), 3)?;
        manager.add_slave(cmd, None, SpawnOptions::default());
    }

    let start = Instant::now();
    let outcome = manager.poll(true)?;
    let elapsed = start.elapsed();

    assert_eq!(outcome.started.len(), 2);
    assert!(elapsed < Duration::from_secs(2), "poll took {elapsed:?}");
    manager.kill_active();
    Ok(())
}

#[test]
fn slave_that_failed_to_launch_is_retried_once_its_program_exists() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let real = write_file(
        dir.path(),
        "real-tool.sh",
        "#!/bin/sh\nprintf '{}' >&\"$RESPAWN_SLAVE_RESULT\"\n",
    )?;
    fs::set_permissions(&real, fs::Permissions::from_mode(0o755))?;
    let tool = dir.path().join("tool.sh");

    let mut manager = Manager::new(1);
    let id = manager.add_slave(
        [tool.display().to_string()],
        Some("tool".into()),
        SpawnOptions::default(),
    );

    let outcome = manager.poll(true)?;
    assert!(outcome.started.is_empty());
    let slave = manager.slave(id).ok_or("missing slave")?;
    assert!(!slave.is_running());
    assert!(slave.needed());

    // Still failing: skipped, not retried in a loop.
    assert!(manager.poll(true)?.started.is_empty());

    symlink(&real, &tool)?;
    let outcome = manager.poll(true)?;
    assert_eq!(outcome.started, vec![id]);
    reap_all(&mut manager, &[id])?;
    assert!(manager.slave(id).ok_or("missing slave")?.success()?);
    Ok(())
}

#[test]
fn joining_a_shared_file_with_newer_content_retires_earlier_slaves() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let shared = write_file(dir.path(), "shared.bin", "v1")?;
    let first = Slave::new(["true"]).id();
    let second = Slave::new(["true"]).id();

    let mut program_id = ProgramId::new();
    program_id.register_file(&shared, &[])?;
    let v1 = program_id.get(&shared).cloned().ok_or("not registered")?;

    let mut tracked = TrackedFile::new(v1.clone());
    assert!(tracked.join(first, v1.clone()).is_empty());

    rewrite(&shared, "v2")?;
    program_id.register_file(&shared, &[])?;
    let v2 = program_id.get(&shared).cloned().ok_or("not registered")?;
    assert_ne!(v1.content_id, v2.content_id);

    assert_eq!(tracked.join(second, v2.clone()), vec![first]);
    assert_eq!(tracked.slaves().iter().copied().collect::<Vec<_>>(), vec![second]);
    assert_eq!(tracked.record().content_id, v2.content_id);
    // The second slave saw v2 already.
    assert!(!tracked.update(program_id.policy()));

    // Same content: the slave simply joins.
    assert!(tracked.join(first, v2).is_empty());
    assert_eq!(tracked.slaves().len(), 2);
    Ok(())
}
