use crate::status::{EfiResult, Status, StatusCode};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;

/// One running process as seen during an enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    pub command: String,
    pub owner: String,
}

/// Enumerates running processes and diffs consecutive passes.
///
/// `last` is the most recent enumeration; `new` holds pids present now but
/// absent before; `dead` holds pids present before but absent now.
#[derive(Debug, Default)]
pub struct ProcessLister {
    last: Vec<ProcessRecord>,
    fresh: Vec<ProcessRecord>,
    dead: Vec<ProcessRecord>,
}

fn resolve_owner(uid: u32) -> String {
    match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn enumerate() -> EfiResult<Vec<ProcessRecord>> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot enumerate /proc: {}", e)))?;

    let mut detected = vec![];
    for entry in entries.flatten() {
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        // The process may vanish between readdir and the stat below.
        let uid = match entry.metadata() {
            Ok(meta) => meta.uid(),
            Err(_) => continue,
        };
        let command = std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .map(|c| c.trim_end().to_string())
            .unwrap_or_default();
        detected.push(ProcessRecord {
            pid,
            command,
            owner: resolve_owner(uid),
        });
    }
    detected.sort_by_key(|r| r.pid);
    Ok(detected)
}

impl ProcessLister {
    pub fn new() -> Self {
        ProcessLister::default()
    }

    /// Re-enumerate and recompute the `last`/`new`/`dead` sets.
    pub fn detect(&mut self) -> EfiResult<()> {
        let detected = enumerate()?;
        self.diff(detected);
        Ok(())
    }

    fn diff(&mut self, detected: Vec<ProcessRecord>) {
        let previous: HashMap<i32, &ProcessRecord> =
            self.last.iter().map(|r| (r.pid, r)).collect();
        let current: HashMap<i32, &ProcessRecord> = detected.iter().map(|r| (r.pid, r)).collect();

        self.fresh = detected
            .iter()
            .filter(|r| !previous.contains_key(&r.pid))
            .cloned()
            .collect();
        self.dead = self
            .last
            .iter()
            .filter(|r| !current.contains_key(&r.pid))
            .cloned()
            .collect();
        self.last = detected;
    }

    pub fn last(&self) -> &[ProcessRecord] {
        &self.last
    }

    pub fn new_processes(&self) -> &[ProcessRecord] {
        &self.fresh
    }

    pub fn dead_processes(&self) -> &[ProcessRecord] {
        &self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record(pid: i32) -> ProcessRecord {
        ProcessRecord {
            pid,
            command: format!("cmd{}", pid),
            owner: "tester".to_string(),
        }
    }

    #[rstest]
    fn first_pass_reports_everything_as_new() {
        let mut lister = ProcessLister::new();
        lister.diff(vec![record(1), record(2)]);
        assert_eq!(lister.new_processes().len(), 2);
        assert!(lister.dead_processes().is_empty());
        assert_eq!(lister.last().len(), 2);
    }

    #[rstest]
    fn diffs_new_and_dead_sets() {
        let mut lister = ProcessLister::new();
        lister.diff(vec![record(1), record(2), record(3)]);
        lister.diff(vec![record(2), record(3), record(4)]);

        let new_pids: Vec<i32> = lister.new_processes().iter().map(|r| r.pid).collect();
        let dead_pids: Vec<i32> = lister.dead_processes().iter().map(|r| r.pid).collect();
        assert_eq!(new_pids, vec![4]);
        assert_eq!(dead_pids, vec![1]);
    }

    #[rstest]
    fn steady_state_has_no_churn() {
        let mut lister = ProcessLister::new();
        lister.diff(vec![record(5)]);
        lister.diff(vec![record(5)]);
        assert!(lister.new_processes().is_empty());
        assert!(lister.dead_processes().is_empty());
    }

    #[rstest]
    fn live_enumeration_sees_ourselves() {
        let mut lister = ProcessLister::new();
        lister.detect().unwrap();
        let me = std::process::id() as i32;
        assert!(lister.last().iter().any(|r| r.pid == me));
    }
}
