use crate::status::{EfiResult, Status, StatusCode};
use std::collections::BTreeMap;

const CPUINFO_PTH: &str = "/proc/cpuinfo";

/// One logical CPU as reported by `/proc/cpuinfo`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuCore {
    pub logical_id: i32,
    pub core_id: i32,
    pub clock_mhz: f32,
}

/// Socket to core mapping parsed from `/proc/cpuinfo`.
///
/// Rebuilt in full on every [CpuTopology::refresh]; inside each socket the
/// cores are ordered by logical id.
#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    topology: BTreeMap<i32, Vec<CpuCore>>,
    num_logical_cores: i32,
    num_physical_cores: i32,
    num_sockets: i32,
}

impl CpuTopology {
    pub fn new() -> EfiResult<Self> {
        let mut info = CpuTopology::default();
        info.refresh()?;
        Ok(info)
    }

    /// Re-read `/proc/cpuinfo` and rebuild the map.
    pub fn refresh(&mut self) -> EfiResult<()> {
        let buff = std::fs::read_to_string(CPUINFO_PTH).map_err(|e| {
            Status::new(StatusCode::FileError, format!("Cannot read {}: {}", CPUINFO_PTH, e))
        })?;
        self.parse(&buff);
        Ok(())
    }

    fn parse(&mut self, buff: &str) {
        self.topology.clear();
        self.num_logical_cores = 0;
        self.num_physical_cores = 0;
        self.num_sockets = 0;

        let mut logical_id = 0;
        let mut socket_id = 0;
        let mut clock_mhz = 0.0f32;

        for line in buff.lines() {
            let value = match line.find(": ") {
                Some(idx) => &line[idx + 2..],
                None => continue,
            };
            if line.starts_with("processor") {
                logical_id = value.parse().unwrap_or(0);
                self.num_logical_cores = self.num_logical_cores.max(logical_id + 1);
            } else if line.starts_with("cpu MHz") {
                clock_mhz = value.parse().unwrap_or(0.0);
            } else if line.starts_with("physical id") {
                socket_id = value.parse().unwrap_or(0);
                self.num_sockets = self.num_sockets.max(socket_id + 1);
            } else if line.starts_with("core id") {
                let core_id: i32 = value.parse().unwrap_or(0);
                self.num_physical_cores = self.num_physical_cores.max(core_id + 1);
                self.topology.entry(socket_id).or_default().push(CpuCore {
                    logical_id,
                    core_id,
                    clock_mhz,
                });
            }
        }

        for cores in self.topology.values_mut() {
            cores.sort_by_key(|c| c.logical_id);
        }
    }

    pub fn num_sockets(&self) -> i32 {
        self.num_sockets
    }

    pub fn num_logical_cores(&self) -> i32 {
        self.num_logical_cores
    }

    pub fn num_physical_cores(&self) -> i32 {
        self.num_physical_cores
    }

    pub fn assignment(&self) -> &BTreeMap<i32, Vec<CpuCore>> {
        &self.topology
    }

    /// Arithmetic mean of the per-core clocks inside each socket, MHz.
    pub fn socket_mean_frequency(&self) -> Vec<f32> {
        let mut means = vec![0.0f32; self.num_sockets.max(0) as usize];
        for (socket, cores) in &self.topology {
            if cores.is_empty() {
                continue;
            }
            let sum: f32 = cores.iter().map(|c| c.clock_mhz).sum();
            if let Some(slot) = means.get_mut(*socket as usize) {
                *slot = sum / cores.len() as f32;
            }
        }
        means
    }

    /// Mean of the socket means, MHz.
    pub fn mean_frequency(&self) -> f32 {
        let means = self.socket_mean_frequency();
        if means.is_empty() {
            return 0.0;
        }
        means.iter().sum::<f32>() / means.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TWO_SOCKETS: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu MHz\t\t: 2000.000
physical id\t: 0
core id\t\t: 0

processor\t: 1
cpu MHz\t\t: 2200.000
physical id\t: 0
core id\t\t: 1

processor\t: 2
cpu MHz\t\t: 3000.000
physical id\t: 1
core id\t\t: 0

processor\t: 3
cpu MHz\t\t: 3400.000
physical id\t: 1
core id\t\t: 1
";

    fn parsed() -> CpuTopology {
        let mut topo = CpuTopology::default();
        topo.parse(TWO_SOCKETS);
        topo
    }

    #[rstest]
    fn counts_sockets_and_cores() {
        let topo = parsed();
        assert_eq!(topo.num_sockets(), 2);
        assert_eq!(topo.num_logical_cores(), 4);
        assert_eq!(topo.num_physical_cores(), 2);
    }

    #[rstest]
    fn cores_are_sorted_by_logical_id() {
        let topo = parsed();
        let socket0 = &topo.assignment()[&0];
        assert_eq!(socket0.len(), 2);
        assert_eq!(socket0[0].logical_id, 0);
        assert_eq!(socket0[1].logical_id, 1);
        assert_eq!(socket0[1].core_id, 1);
    }

    #[rstest]
    fn socket_means_are_per_socket_averages() {
        let topo = parsed();
        let means = topo.socket_mean_frequency();
        assert_eq!(means.len(), 2);
        assert!((means[0] - 2100.0).abs() < 1e-3);
        assert!((means[1] - 3200.0).abs() < 1e-3);
        assert!((topo.mean_frequency() - 2650.0).abs() < 1e-3);
    }

    #[rstest]
    fn reparse_replaces_previous_map() {
        let mut topo = parsed();
        topo.parse("processor\t: 0\ncpu MHz\t\t: 1000.000\nphysical id\t: 0\ncore id\t\t: 0\n");
        assert_eq!(topo.num_sockets(), 1);
        assert_eq!(topo.assignment()[&0].len(), 1);
    }

    #[rstest]
    fn live_cpuinfo_parses() {
        let topo = CpuTopology::new().unwrap();
        assert!(topo.num_logical_cores() >= 1);
    }
}
