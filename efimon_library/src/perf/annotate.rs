use crate::asm::{AsmClassifier, X86Classifier};
use crate::clock::uptime_ms;
use crate::observer::{Observer, ObserverCapabilities, ObserverScope, ObserverType};
use crate::perf::record::PerfRecordObserver;
use crate::readings::{InstructionReadings, Readings};
use crate::status::{EfiResult, Status, StatusCode};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Sampled weights at or below this percentage are dropped.
const ANNOTATE_THRESHOLD: f32 = 0.01;

/// One annotated instruction line: (percent, mnemonic, operands).
fn parse_line(line: &str) -> Option<(f32, String, String)> {
    let mut tokens = line.split_ascii_whitespace();
    let percent: f32 = tokens.next()?.parse().ok()?;
    let _colon = tokens.next()?;
    let _address = tokens.next()?;
    let mnemonic = tokens.next()?.to_string();
    let operands = tokens.collect::<Vec<&str>>().join(" ");
    Some((percent, mnemonic, operands))
}

/// Streams the annotator's textual output over a recorded trace and
/// accumulates the instruction histogram plus the
/// (type, family, operand-origin) taxonomy.
///
/// Holding a handle to the upstream recorder is the only way to construct
/// one; the annotate pass refuses to run until the recorder has captured a
/// valid trace.
pub struct PerfAnnotateObserver {
    caps: [ObserverCapabilities; 1],
    record: Arc<Mutex<PerfRecordObserver>>,
    interval: u64,
    valid: bool,
    classifier: Box<dyn AsmClassifier>,
    readings: InstructionReadings,
}

impl PerfAnnotateObserver {
    pub fn new(record: Arc<Mutex<PerfRecordObserver>>) -> Self {
        let observer_type =
            ObserverType::CPU | ObserverType::INTERVAL | ObserverType::CPU_INSTRUCTIONS;
        let scope = ObserverScope::Process;
        PerfAnnotateObserver {
            caps: [ObserverCapabilities {
                observer_type,
                scope,
            }],
            record,
            interval: 0,
            valid: false,
            classifier: Box::new(X86Classifier),
            readings: InstructionReadings::default(),
        }
    }

    /// Whether the histogram reflects a fully parsed annotation pass.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Fold the annotated lines into the histogram and the taxonomy map.
    fn parse_results<I>(&mut self, lines: I)
    where
        I: Iterator<Item = String>,
    {
        self.readings.histogram.clear();
        self.readings.classification.clear();

        for line in lines {
            let (percent, mnemonic, operands) = match parse_line(&line) {
                Some(parsed) => parsed,
                None => continue,
            };
            if percent <= ANNOTATE_THRESHOLD {
                continue;
            }

            let op_types = self.classifier.operand_types(&operands);
            let key = format!("{}_{}", mnemonic, op_types);
            *self.readings.histogram.entry(key).or_insert(0.0) += percent;

            let pair = self.classifier.classify(&mnemonic, &op_types);
            *self
                .readings
                .classification
                .entry(pair.itype)
                .or_default()
                .entry(pair.family)
                .or_default()
                .entry(pair.origin)
                .or_insert(0.0) += percent;
        }
    }
}

impl Observer for PerfAnnotateObserver {
    fn trigger(&mut self) -> EfiResult<()> {
        let trace = {
            let record = self.record.lock();
            if !record.is_valid() {
                return Err(Status::new(StatusCode::NotReady, "Not ready to query"));
            }
            record.trace_path().clone()
        };

        let pipeline = format!(
            "perf annotate -q --percent-type global-period -i {} | sort -r -k2,1n",
            trace.display()
        );
        let mut child = Command::new("sh")
            .args(["-c", &pipeline])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Status::new(StatusCode::FileError, format!("Cannot execute perf annotate: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::new(StatusCode::FileError, "perf annotate produced no stdout"))?;
        let lines = BufReader::new(stdout).lines().map_while(Result::ok);
        self.parse_results(lines);

        let _ = child.wait();

        let now = uptime_ms()?;
        self.readings.base.observer_type = self.caps[0].observer_type;
        self.readings.base.stamp(now);
        self.valid = true;
        Ok(())
    }

    fn readings(&self) -> Vec<Readings> {
        vec![Readings::Instruction(self.readings.clone())]
    }

    fn select_device(&mut self, _device: u32) -> EfiResult<()> {
        Err(Status::new(
            StatusCode::NotImplemented,
            "It is not possible to select a device since this is a wrapper class",
        ))
    }

    fn set_scope(&mut self, _scope: ObserverScope) -> EfiResult<()> {
        Err(Status::new(
            StatusCode::NotImplemented,
            "It is not possible to change the scope since this is a wrapper class",
        ))
    }

    fn set_pid(&mut self, _pid: u32) -> EfiResult<()> {
        Err(Status::new(
            StatusCode::NotImplemented,
            "It is not possible to change the PID since this is a wrapper class",
        ))
    }

    fn set_interval(&mut self, interval_ms: u64) -> EfiResult<()> {
        self.interval = interval_ms;
        Ok(())
    }

    fn clear_interval(&mut self) -> EfiResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> EfiResult<()> {
        self.valid = false;
        self.readings = InstructionReadings::default();
        Ok(())
    }

    fn scope(&self) -> ObserverScope {
        self.record.lock().scope()
    }

    fn pid(&self) -> u32 {
        self.record.lock().pid()
    }

    fn capabilities(&self) -> &[ObserverCapabilities] {
        &self.caps
    }

    fn status(&self) -> Status {
        Status::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{origin_decomposed, DataOrigin, InstructionFamily, InstructionType};
    use rstest::rstest;

    fn test_observer() -> PerfAnnotateObserver {
        let record = PerfRecordObserver::new(0, ObserverScope::Process, 1, 100, false).unwrap();
        PerfAnnotateObserver::new(Arc::new(Mutex::new(record)))
    }

    fn feed(obs: &mut PerfAnnotateObserver, text: &str) {
        obs.parse_results(text.lines().map(|l| l.to_string()));
    }

    const ANNOTATION: &str = "\
    12.50 :   401000:       vaddpd %ymm1,%ymm2,%ymm3
     8.25 :   401008:       mov    %rax,%rbx
     8.25 :   401010:       mov    (%rsi),%rcx
     0.01 :   401018:       xor    %eax,%eax
     0.00 :   401020:       nop
Disassembly of section .text:
     2.00 :   401028:       jle    401000 <loop>
";

    #[rstest]
    fn parses_percent_mnemonic_and_operands() {
        let (percent, mnemonic, operands) =
            parse_line("    12.50 :   401000:       vaddpd %ymm1,%ymm2,%ymm3").unwrap();
        assert!((percent - 12.5).abs() < 1e-6);
        assert_eq!(mnemonic, "vaddpd");
        assert_eq!(operands, "%ymm1,%ymm2,%ymm3");
    }

    #[rstest]
    fn non_numeric_lines_are_skipped() {
        assert!(parse_line("Disassembly of section .text:").is_none());
        assert!(parse_line("").is_none());
    }

    #[rstest]
    fn threshold_filters_the_histogram() {
        let mut obs = test_observer();
        feed(&mut obs, ANNOTATION);

        // 0.01 and 0.00 rows are at or below the threshold and must vanish.
        let keys: Vec<&String> = obs.readings.histogram.keys().collect();
        assert_eq!(keys.len(), 4);
        assert!(obs.readings.histogram.contains_key("vaddpd_rr"));
        assert!(obs.readings.histogram.contains_key("mov_rr"));
        assert!(obs.readings.histogram.contains_key("mov_rm"));
        assert!(obs.readings.histogram.contains_key("jle_m"));
        assert!(!obs.readings.histogram.keys().any(|k| k.starts_with("xor")));
        assert!(!obs.readings.histogram.keys().any(|k| k.starts_with("nop")));
    }

    #[rstest]
    fn taxonomy_and_histogram_budgets_match() {
        let mut obs = test_observer();
        feed(&mut obs, ANNOTATION);

        let histogram_sum: f32 = obs.readings.histogram.values().sum();
        let taxonomy_sum: f32 = obs
            .readings
            .classification
            .values()
            .flat_map(|families| families.values())
            .flat_map(|origins| origins.values())
            .sum();
        assert!((histogram_sum - taxonomy_sum).abs() < 1e-4);
        assert!((histogram_sum - 31.0).abs() < 1e-4);
    }

    #[rstest]
    fn classification_lands_in_the_right_bucket() {
        let mut obs = test_observer();
        feed(&mut obs, ANNOTATION);

        let vector_arith = obs
            .readings
            .classification
            .get(&InstructionType::Vector)
            .and_then(|f| f.get(&InstructionFamily::Arithmetic))
            .unwrap();
        let (weight, origin) = vector_arith
            .iter()
            .map(|(origin, w)| (*w, *origin))
            .next()
            .unwrap();
        assert!((weight - 12.5).abs() < 1e-6);
        assert_eq!(
            origin_decomposed(origin),
            (DataOrigin::Register, DataOrigin::Register)
        );

        // Both mov rows are Scalar/Memory with distinct origins.
        let scalar_mem = obs
            .readings
            .classification
            .get(&InstructionType::Scalar)
            .and_then(|f| f.get(&InstructionFamily::Memory))
            .unwrap();
        assert_eq!(scalar_mem.len(), 2);
    }

    #[rstest]
    fn repeated_mnemonics_accumulate() {
        let mut obs = test_observer();
        feed(
            &mut obs,
            "    5.00 :   400000:       add %rax,%rbx\n    2.50 :   400008:       add %rcx,%rdx\n",
        );
        let weight = obs.readings.histogram.get("add_rr").unwrap();
        assert!((weight - 7.5).abs() < 1e-6);
    }

    #[rstest]
    fn annotate_without_a_trace_is_not_ready() {
        let mut obs = test_observer();
        let err = obs.trigger().unwrap_err();
        assert_eq!(err.code, StatusCode::NotReady);
    }

    #[rstest]
    fn reparsing_replaces_previous_results() {
        let mut obs = test_observer();
        feed(&mut obs, ANNOTATION);
        feed(&mut obs, "    3.00 :   400000:       sub %rax,%rbx\n");
        assert_eq!(obs.readings.histogram.len(), 1);
        assert!(obs.readings.histogram.contains_key("sub_rr"));
    }
}
