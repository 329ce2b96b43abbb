//! Agent state: the previous CPU counter reading and the loop phase.

/// Cumulative `/proc/stat` ticks from one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub total: u64,
    pub idle: u64,
}

/// Previous CPU reading carried between cycles. `None` until the first
/// successful parse, so a first sample can never be computed against zero
/// baselines.
#[derive(Debug, Default)]
pub struct CpuCounterState {
    prev: Option<CpuTicks>,
}

impl CpuCounterState {
    pub fn previous(&self) -> Option<CpuTicks> {
        self.prev
    }

    /// Store `now` and hand back what it replaced.
    pub fn replace(&mut self, now: CpuTicks) -> Option<CpuTicks> {
        self.prev.replace(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    Sampling,
    Publishing,
}

impl AgentPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Sampling => "sampling",
            AgentPhase::Publishing => "publishing",
        }
    }
}
