//! Cross-process port allocation: a JSON `{port: pid}` record guarded by an
//! exclusive advisory file lock, so sibling processes on the same host never
//! race for the same port (spec.md §4.8).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::explicit_iter_loop, clippy::use_self)]

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use observability_deps::tracing::{debug, info, warn};
use thiserror::Error;

/// Errors from [`acquire_port`]/[`acquire_port_in`].
#[derive(Debug, Error)]
pub enum PortLeaseError {
    /// Filesystem or locking failure.
    #[error("port lease I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// No port in the requested range passed both the allocation-record and
    /// live-bind checks.
    #[error("no available port in range {start}-{end}")]
    Exhausted {
        /// The range's inclusive lower bound.
        start: u16,
        /// The range's inclusive upper bound.
        end: u16,
    },
    /// No home directory could be resolved to place the default lease files.
    #[error("could not resolve a home directory for the port lease record")]
    NoHomeDir,
}

const DEFAULT_RANGE: RangeInclusive<u16> = 30000..=32767;

/// Acquire a port in `[30000, 32767]` under `~/.neutree/ports`.
///
/// See [`acquire_port_range`] and [`acquire_port_in`] to use a different
/// range or a different base directory (the latter mainly for tests).
pub fn acquire_port() -> Result<u16, PortLeaseError> {
    acquire_port_range(DEFAULT_RANGE)
}

/// Acquire a port in `range` under `~/.neutree/ports`.
pub fn acquire_port_range(range: RangeInclusive<u16>) -> Result<u16, PortLeaseError> {
    let home = dirs::home_dir().ok_or(PortLeaseError::NoHomeDir)?;
    acquire_port_in(&home.join(".neutree").join("ports"), range)
}

/// Acquire a port in `range`, persisting the allocation record under
/// `base_dir` rather than the default `~/.neutree/ports`.
///
/// This is the testable core: [`acquire_port`]/[`acquire_port_range`] are
/// thin wrappers that resolve `base_dir` from the environment.
pub fn acquire_port_in(base_dir: &Path, range: RangeInclusive<u16>) -> Result<u16, PortLeaseError> {
    std::fs::create_dir_all(base_dir)?;
    let record_path = base_dir.join("allocated_ports.json");
    let lock_path = base_dir.join("port_lock");

    let lock_file = OpenOptions::new().write(true).create(true).truncate(false).open(&lock_path)?;
    lock_file.lock_exclusive()?;
    let result = allocate_locked(&record_path, range);
    // An advisory lock is released automatically when `lock_file` drops, but
    // doing it explicitly keeps the critical section's extent obvious.
    lock_file.unlock().ok();
    result
}

fn allocate_locked(record_path: &PathBuf, range: RangeInclusive<u16>) -> Result<u16, PortLeaseError> {
    let mut allocated = read_record(record_path)?;
    gc_dead_pids(&mut allocated);

    let current_pid = std::process::id() as i64;

    for port in range.clone() {
        match allocated.get(&port) {
            Some(pid) if *pid == current_pid => {
                debug!(port, "port_lease: this process already holds this port");
                return Ok(port);
            }
            Some(_) => continue,
            None => {
                if is_port_available(port) {
                    allocated.insert(port, current_pid);
                    write_record(record_path, &allocated)?;
                    info!(port, pid = current_pid, "port_lease: allocated port");
                    return Ok(port);
                }
            }
        }
    }

    write_record(record_path, &allocated)?;
    Err(PortLeaseError::Exhausted {
        start: *range.start(),
        end: *range.end(),
    })
}

fn read_record(path: &Path) -> Result<BTreeMap<u16, i64>, PortLeaseError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    // A `{port_string: pid}` JSON object, matching the on-disk format (spec.md
    // §6 "Persistent state"); keys round-trip through serde_json as strings
    // regardless of the map's key type, so parse as `<String, i64>` first.
    let raw: BTreeMap<String, i64> = match serde_json::from_str(&contents) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "port_lease: corrupt allocation record, starting fresh");
            return Ok(BTreeMap::new());
        }
    };
    Ok(raw.into_iter().filter_map(|(k, v)| k.parse::<u16>().ok().map(|p| (p, v))).collect())
}

fn write_record(path: &Path, allocated: &BTreeMap<u16, i64>) -> Result<(), PortLeaseError> {
    let raw: BTreeMap<String, i64> = allocated.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    let contents = serde_json::to_string(&raw).expect("BTreeMap<String, i64> is always serializable");
    file.write_all(contents.as_bytes())?;
    Ok(())
}

fn gc_dead_pids(allocated: &mut BTreeMap<u16, i64>) {
    allocated.retain(|port, pid| {
        let alive = pid_is_alive(*pid);
        if !alive {
            debug!(port, pid, "port_lease: pruning dead-pid allocation");
        }
        alive
    });
}

#[cfg(unix)]
fn pid_is_alive(pid: i64) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match i32::try_from(pid) {
        Ok(pid) => !matches!(kill(Pid::from_raw(pid), None), Err(nix::errno::Errno::ESRCH)),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: i64) -> bool {
    // No portable liveness probe off Unix; treat every recorded pid as alive
    // so allocation falls back to the live-bind check instead of reclaiming
    // a port that's still legitimately held.
    true
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_free_port_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let port = acquire_port_in(dir.path(), 40000..=40010).unwrap();
        assert!((40000..=40010).contains(&port));

        let record = read_record(&dir.path().join("allocated_ports.json")).unwrap();
        assert_eq!(record.get(&port), Some(&(std::process::id() as i64)));
    }

    #[test]
    fn repeat_allocation_from_same_process_returns_same_port() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire_port_in(dir.path(), 40100..=40110).unwrap();
        let second = acquire_port_in(dir.path(), 40100..=40110).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn prunes_dead_pid_entries_before_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("allocated_ports.json");
        std::fs::create_dir_all(dir.path()).unwrap();
        // A pid essentially guaranteed not to be alive.
        write_record(&record_path, &BTreeMap::from([(40200, 999_999_999_i64)])).unwrap();

        let port = acquire_port_in(dir.path(), 40200..=40200).unwrap();
        assert_eq!(port, 40200);
    }

    #[test]
    fn exhausted_range_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let record_path = dir.path().join("allocated_ports.json");
        std::fs::create_dir_all(dir.path()).unwrap();
        // pid 1 (init) is always alive and never this test process, so the
        // entry survives dead-pid GC and the range stays exhausted.
        write_record(&record_path, &BTreeMap::from([(40300, 1_i64)])).unwrap();

        let err = acquire_port_in(dir.path(), 40300..=40300).unwrap_err();
        assert!(matches!(err, PortLeaseError::Exhausted { .. }));
    }

    #[test]
    fn corrupt_record_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("allocated_ports.json"), "not json").unwrap();
        let port = acquire_port_in(dir.path(), 40400..=40410).unwrap();
        assert!((40400..=40410).contains(&port));
    }
}
