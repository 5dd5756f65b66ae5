use std::collections::BTreeMap;
use std::error::Error;
use std::io::{Read, Write};
use std::os::unix::io::IntoRawFd;

use tempfile::tempdir;

use respawn::errors::RespawnError;
use respawn::exec::{INITIAL_STATE_ENV, SLAVE_INITIAL_STATE_ENV, SLAVE_RESULT_ENV};
use respawn::supervisor::{ProcessRole, Respawn, SlaveSession};
use respawn::types::{InitialState, SlaveReport, Subcommand};
use respawn::watch::ProgramId;
use respawn_test_utils::fixtures::write_file;
use respawn_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

fn role_from(vars: &[(&str, &str)]) -> ProcessRole {
    let vars: BTreeMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ProcessRole::from_vars(|key| vars.get(key).cloned())
}

#[test]
fn role_is_read_from_the_environment() {
    init_tracing();
    assert_eq!(role_from(&[]), ProcessRole::Standalone);
    assert_eq!(
        role_from(&[(INITIAL_STATE_ENV, "7")]),
        ProcessRole::Respawned { state_fd: 7 }
    );
    assert_eq!(
        role_from(&[(SLAVE_INITIAL_STATE_ENV, "3"), (SLAVE_RESULT_ENV, "4")]),
        ProcessRole::Slave {
            initial_state_fd: 3,
            result_fd: 4
        }
    );
    // Slave wins over respawn.
    assert!(
        role_from(&[
            (INITIAL_STATE_ENV, "7"),
            (SLAVE_INITIAL_STATE_ENV, "3"),
            (SLAVE_RESULT_ENV, "4"),
        ])
        .is_slave()
    );
    // Half a slave environment, or garbage, is ignored.
    assert_eq!(role_from(&[(SLAVE_RESULT_ENV, "4")]), ProcessRole::Standalone);
    assert_eq!(role_from(&[(INITIAL_STATE_ENV, "seven")]), ProcessRole::Standalone);
    assert_eq!(role_from(&[(INITIAL_STATE_ENV, "-1")]), ProcessRole::Standalone);
}

#[test]
fn session_requires_slave_role() {
    init_tracing();
    assert!(matches!(
        SlaveSession::open(&ProcessRole::Standalone),
        Err(RespawnError::NotSlave)
    ));
    assert!(matches!(
        SlaveSession::open(&ProcessRole::Respawned { state_fd: 0 }),
        Err(RespawnError::NotSlave)
    ));
}

// Descriptors are adopted once per process, so the whole protocol runs in a
// single test.
#[test]
fn session_reads_initial_state_and_reports() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let dep = write_file(dir.path(), "dep.txt", "dep")?;
    let mut program_id = ProgramId::new();
    program_id.register_file(&dep, &[])?;

    let (initial_r, mut initial_w) = std::io::pipe()?;
    let (mut result_r, result_w) = std::io::pipe()?;
    serde_json::to_writer(
        &mut initial_w,
        &InitialState {
            name: Some("worker".into()),
            program_id: program_id.clone(),
        },
    )?;
    initial_w.flush()?;
    drop(initial_w);

    let initial_fd = initial_r.into_raw_fd();
    let role = ProcessRole::Slave {
        initial_state_fd: initial_fd,
        result_fd: result_w.into_raw_fd(),
    };

    let session = SlaveSession::open(&role)?;
    assert_eq!(session.name(), Some("worker"));
    assert_eq!(session.program_id(), &program_id);

    // Already owned by the session.
    assert!(SlaveSession::open(&role).is_err());

    let sub = Subcommand::new(Some("next".into()), ["true"]);
    session.report(vec![sub.clone()], vec![dep.clone()])?;

    let mut bytes = Vec::new();
    result_r.read_to_end(&mut bytes)?;
    let report: SlaveReport = serde_json::from_slice(&bytes)?;
    assert_eq!(report.subcommands, vec![sub]);
    assert_eq!(report.files, vec![dep]);
    Ok(())
}

#[test]
fn requires_records_loaded_and_failed_paths() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let present = write_file(dir.path(), "present.toml", "a = 1")?;

    let mut respawn = Respawn::new(ProcessRole::Standalone)
        .with_search_path(vec![dir.path().to_path_buf()])
        .track_exe(false);

    assert!(respawn.requires(|loader| {
        let text = loader.read_to_string("present.toml")?;
        assert_eq!(text, "a = 1");
        Ok(())
    }));
    assert!(!respawn.requires(|loader| loader.track("missing.toml").map(|_| ())));

    assert!(respawn.required_paths().contains(&present));
    assert!(respawn.error_paths().contains(&dir.path().join("missing.toml")));
    assert_eq!(respawn.errors().len(), 1);
    assert!(respawn.errors()[0].is_not_found());

    let files = respawn.currently_loaded_files();
    assert_eq!(files.len(), 2);
    Ok(())
}

#[test]
fn dump_initial_state_snapshots_present_and_absent_files() -> TestResult {
    init_tracing();
    let dir = tempdir()?;
    let present = write_file(dir.path(), "present.txt", "here")?;
    let missing = dir.path().join("missing.txt");

    let respawn = Respawn::new(ProcessRole::Standalone).track_exe(false);
    assert!(!respawn.has_initial_state());

    let mut file = respawn.dump_initial_state([&present, &missing])?;
    let mut json = String::new();
    file.read_to_string(&mut json)?;
    let snapshot: ProgramId = serde_json::from_str(&json)?;

    assert!(snapshot.contains(&present));
    assert!(snapshot.is_absent(&missing));
    assert!(!snapshot.changed());

    write_file(dir.path(), "missing.txt", "now here")?;
    assert!(snapshot.changed());
    Ok(())
}
