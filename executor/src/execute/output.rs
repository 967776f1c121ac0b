use crate::diagnostics::{Diagnostics, HookContext, HostSignal};
use crate::planner::BenchmarkId;
use std::io::{BufRead, BufReader, Read, Write};
use tracing::{debug, error, warn};

/// Token written to the engine's stdin once a signal has been consumed.
pub const ACKNOWLEDGMENT_TOKEN: &str = "Acknowledged";

/// Lines carrying this prefix are auxiliary unless they are a known signal;
/// everything else non-empty is measurement data.
pub const AUXILIARY_PREFIX: &str = "//";

// what the loader prints when an artifact was built for the wrong word size
const ARCH_MISMATCH_MARKERS: &[&str] = &["Exec format error", "wrong ELF class"];

/// Actionable hint surfaced once per run when a mismatch marker is seen.
pub const ARCH_MISMATCH_HINT: &str =
    "The artifact was built for a different architecture than this host, rebuild it for the host target";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineKind {
    Result,
    Auxiliary,
    Control,
}

/// One captured output line in receipt order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

/// Everything the drain pass captured, in arrival order across all kinds, so
/// the global timeline stays reconstructible after partitioning.
#[derive(Debug, Default)]
pub struct Transcript {
    pub lines: Vec<OutputLine>,
    pub arch_mismatch: bool,
}

impl Transcript {
    pub fn results(&self) -> Vec<String> {
        self.lines_of(LineKind::Result)
    }

    pub fn auxiliary(&self) -> Vec<String> {
        self.lines_of(LineKind::Auxiliary)
    }

    fn lines_of(&self, kind: LineKind) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| line.kind == kind)
            .map(|line| line.text.clone())
            .collect()
    }
}

pub fn classify(line: &str) -> LineKind {
    if HostSignal::from_marker(line).is_some() {
        LineKind::Control
    } else if line.starts_with(AUXILIARY_PREFIX) {
        LineKind::Auxiliary
    } else {
        LineKind::Result
    }
}

/// Drains the child's stdout for the whole process lifetime, classifying each
/// line as it arrives, and answers engine signals over the child's stdin.
///
/// Generic over the streams so the protocol can be exercised against
/// in-memory buffers; the orchestrator instantiates it with the child's
/// actual pipes and runs `drain` on its own thread.
pub struct OutputSynchronizer<'a, R, W> {
    output: R,
    input: Option<W>,
    diagnostics: &'a dyn Diagnostics,
    benchmark: &'a BenchmarkId,
    process_id: u32,
}

impl<'a, R: Read, W: Write> OutputSynchronizer<'a, R, W> {
    pub fn new(
        output: R,
        input: Option<W>,
        diagnostics: &'a dyn Diagnostics,
        benchmark: &'a BenchmarkId,
        process_id: u32,
    ) -> Self {
        Self {
            output,
            input,
            diagnostics,
            benchmark,
            process_id,
        }
    }

    /// Read until the output stream closes. Returns the transcript; losing
    /// the stream early (child killed) just ends the capture.
    pub fn drain(self) -> Transcript {
        let Self {
            output,
            mut input,
            diagnostics,
            benchmark,
            process_id,
        } = self;

        let mut transcript = Transcript::default();
        let mut reader = BufReader::new(output);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    debug!(error = ?error, "Output stream went away while draining");
                    break;
                }
            }

            // decoded lossily so an ill-encoded engine cannot stop the drain
            let text = String::from_utf8_lossy(&buffer);
            let line = text.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }

            if !transcript.arch_mismatch
                && ARCH_MISMATCH_MARKERS
                    .iter()
                    .any(|marker| line.contains(marker))
            {
                transcript.arch_mismatch = true;
                error!(pid = process_id, "{ARCH_MISMATCH_HINT}");
            }

            let kind = classify(line);
            if let Some(signal) = HostSignal::from_marker(line) {
                diagnostics.handle(
                    signal,
                    &HookContext {
                        benchmark,
                        process_id: Some(process_id),
                    },
                );
                acknowledge(&mut input, process_id);
            }

            transcript.lines.push(OutputLine {
                kind,
                text: line.to_owned(),
            });
        }

        transcript
    }
}

// flow control: the engine blocks on its stdin between signals, so the token
// goes out only after the diagnostics callback has returned
fn acknowledge<W: Write>(input: &mut Option<W>, process_id: u32) {
    if let Some(writer) = input.as_mut() {
        let written = writeln!(writer, "{ACKNOWLEDGMENT_TOKEN}").and_then(|_| writer.flush());
        if let Err(error) = written {
            warn!(pid = process_id, error = ?error, "Engine stopped listening for acknowledgments");
            *input = None;
        }
    }
}
