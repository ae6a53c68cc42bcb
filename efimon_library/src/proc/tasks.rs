use crate::status::{EfiResult, Status, StatusCode};

/// Direct children of a process, from `/proc/<P>/task/<P>/children`.
///
/// The tree always starts with the root pid itself.
#[derive(Debug, Clone)]
pub struct ProcessTree {
    pid: i32,
    path: String,
    tree: Vec<i32>,
}

fn parse_children(pid: i32, line: &str) -> Vec<i32> {
    let mut tree = vec![pid];
    tree.extend(line.split_ascii_whitespace().filter_map(|t| t.parse::<i32>().ok()));
    tree
}

impl ProcessTree {
    pub fn new(pid: i32) -> EfiResult<Self> {
        let mut tree = ProcessTree {
            pid,
            path: format!("/proc/{}/task/{}/children", pid, pid),
            tree: vec![],
        };
        tree.refresh()?;
        Ok(tree)
    }

    pub fn refresh(&mut self) -> EfiResult<()> {
        let line = std::fs::read_to_string(&self.path)
            .map_err(|_| Status::new(StatusCode::NotFound, "Cannot access the file for children"))?;
        self.tree = parse_children(self.pid, &line);
        Ok(())
    }

    pub fn tree(&self) -> &[i32] {
        &self.tree
    }
}

/// Thread ids of a process, one per directory entry under `/proc/<P>/task`.
#[derive(Debug, Clone)]
pub struct ThreadTree {
    pid: i32,
    tree: Vec<i32>,
}

impl ThreadTree {
    pub fn new(pid: i32) -> EfiResult<Self> {
        let mut tree = ThreadTree { pid, tree: vec![] };
        tree.refresh()?;
        Ok(tree)
    }

    pub fn refresh(&mut self) -> EfiResult<()> {
        let entries = std::fs::read_dir(format!("/proc/{}/task", self.pid))
            .map_err(|_| Status::new(StatusCode::NotFound, "Cannot access the task directory"))?;
        self.tree = entries
            .flatten()
            .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
            .collect();
        self.tree.sort_unstable();
        Ok(())
    }

    pub fn tree(&self) -> &[i32] {
        &self.tree
    }
}
