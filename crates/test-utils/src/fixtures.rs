//! Files and child scripts used by the integration tests.
//!
//! Slave scripts are plain `sh` scripts talking the result-channel protocol
//! by hand: they find the channel descriptors in the environment and write
//! JSON to them.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use respawn::types::SlaveReport;

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    Ok(path)
}

/// Move the mtime of `path` forward without touching its content.
///
/// Jumps a few seconds ahead so the change is visible on filesystems with
/// coarse timestamps.
pub fn touch(path: &Path) -> io::Result<()> {
    let file = File::options().write(true).open(path)?;
    let current = file.metadata()?.modified()?;
    let later = current.max(SystemTime::now()) + Duration::from_secs(3);
    file.set_modified(later)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn write_script(dir: &Path, name: &str, body: &str) -> io::Result<Vec<String>> {
    let path = write_file(dir, name, &format!("#!/bin/sh\n{body}"))?;
    Ok(vec!["sh".to_string(), path.display().to_string()])
}

/// Script that reports `report` and exits with `exit_code`. Returns its
/// command line.
pub fn report_script(
    dir: &Path,
    name: &str,
    report: &SlaveReport,
    exit_code: i32,
) -> io::Result<Vec<String>> {
    let json = serde_json::to_string(report).map_err(io::Error::other)?;
    write_script(
        dir,
        name,
        &format!(
            "printf '%s' {} >&\"$RESPAWN_SLAVE_RESULT\"\nexit {exit_code}\n",
            shell_quote(&json)
        ),
    )
}

/// Script that kills itself before writing anything.
pub fn crash_script(dir: &Path, name: &str) -> io::Result<Vec<String>> {
    write_script(dir, name, "kill -9 $$\n")
}

/// Script that writes half a report, then dies.
pub fn truncated_report_script(dir: &Path, name: &str) -> io::Result<Vec<String>> {
    write_script(
        dir,
        name,
        "printf '%s' '{\"subcommands\": [' >&\"$RESPAWN_SLAVE_RESULT\"\nkill -9 $$\n",
    )
}

/// Script that copies its initial state to `out`, then reports nothing.
pub fn dump_state_script(dir: &Path, name: &str, out: &Path) -> io::Result<Vec<String>> {
    write_script(
        dir,
        name,
        &format!(
            "cat <&\"$RESPAWN_SLAVE_INITIAL_STATE\" > {}\nprintf '{{}}' >&\"$RESPAWN_SLAVE_RESULT\"\n",
            shell_quote(&out.display().to_string())
        ),
    )
}

/// Script that sleeps, then reports nothing.
pub fn sleep_script(dir: &Path, name: &str, secs: u32) -> io::Result<Vec<String>> {
    write_script(
        dir,
        name,
        &format!("sleep {secs}\nprintf '{{}}' >&\"$RESPAWN_SLAVE_RESULT\"\n"),
    )
}

/// Replace the content of `path` and make sure its stat changes too, even
/// when the new content has the same size and the write lands within the
/// same timestamp tick.
pub fn rewrite(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)?;
    touch(path)
}
