use crate::planner::BenchmarkId;

/// Signals delivered to the diagnostics collaborator.
///
/// The first two frame the process lifecycle and are raised by the
/// orchestrator itself; the rest are engine signals parsed from the child's
/// control lines while it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSignal {
    BeforeProcessStart,
    AfterProcessExit,
    BeforeAnythingElse,
    BeforeActualRun,
    AfterActualRun,
    AfterAll,
}

impl HostSignal {
    /// The control line an engine emits for this signal, if any.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Self::BeforeAnythingElse => Some("// BeforeAnythingElse"),
            Self::BeforeActualRun => Some("// BeforeActualRun"),
            Self::AfterActualRun => Some("// AfterActualRun"),
            Self::AfterAll => Some("// AfterAll"),
            Self::BeforeProcessStart | Self::AfterProcessExit => None,
        }
    }

    pub fn from_marker(line: &str) -> Option<Self> {
        match line {
            "// BeforeAnythingElse" => Some(Self::BeforeAnythingElse),
            "// BeforeActualRun" => Some(Self::BeforeActualRun),
            "// AfterActualRun" => Some(Self::AfterActualRun),
            "// AfterAll" => Some(Self::AfterAll),
            _ => None,
        }
    }
}

/// What a signal was raised for. The process id is absent before the child
/// exists and after it is gone.
#[derive(Clone, Debug)]
pub struct HookContext<'a> {
    pub benchmark: &'a BenchmarkId,
    pub process_id: Option<u32>,
}

/// Instrumentation boundary of the harness.
///
/// `handle` is invoked from the output-drain thread for engine signals, so
/// implementations must be `Sync`. Returning from the call is the consumption
/// signal: the acknowledgment that lets the engine proceed is only written
/// afterwards, which keeps the child paced to the slowest observer.
pub trait Diagnostics: Sync {
    fn handle(&self, signal: HostSignal, context: &HookContext<'_>);
}

/// Diagnostics sink for runs without instrumentation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn handle(&self, _signal: HostSignal, _context: &HookContext<'_>) {}
}
