//! The sample -> assemble -> publish loop.

use std::time::Duration;

use tokio::select;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::ClientCounter;
use crate::error::PublishError;
use crate::metrics::{assemble, CycleSamples};
use crate::publisher::Publisher;
use crate::sampler::RateSampler;
use crate::source::CounterSource;
use crate::state::AgentPhase;
use crate::types::SystemUsage;

/// What the loop did before it was cancelled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: u64,
    pub published: u64,
    pub failed: u64,
}

pub struct AgentLoop<S, C, P> {
    sampler: RateSampler<S>,
    counter: C,
    publisher: P,
    topic: String,
    interface: String,
    interval: Duration,
    phase: AgentPhase,
}

impl<S, C, P> AgentLoop<S, C, P>
where
    S: CounterSource,
    C: ClientCounter,
    P: Publisher,
{
    pub fn new(
        sampler: RateSampler<S>,
        counter: C,
        publisher: P,
        topic: impl Into<String>,
        interface: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            sampler,
            counter,
            publisher,
            topic: topic.into(),
            interface: interface.into(),
            interval,
            phase: AgentPhase::Idle,
        }
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn enter(&mut self, phase: AgentPhase) {
        debug!(from = self.phase.as_str(), to = phase.as_str(), "phase change");
        self.phase = phase;
    }

    /// Tick every `interval` until `cancel` fires. The first cycle runs one
    /// interval after start. Cancellation also abandons a cycle in progress.
    pub async fn run(&mut self, cancel: CancellationToken) -> LoopSummary {
        let mut summary = LoopSummary::default();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        // A slow cycle pushes the schedule back instead of bursting to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(phase = self.phase.as_str(), "cycle abandoned on shutdown");
                    break;
                }
                r = self.run_cycle() => r,
            };
            summary.cycles += 1;
            match outcome {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(error = %e, topic = %self.topic, "publish failed, dropping this cycle");
                }
            }
        }
        self.phase = AgentPhase::Idle;
        info!(
            cycles = summary.cycles,
            published = summary.published,
            failed = summary.failed,
            "agent loop stopped"
        );
        summary
    }

    /// One full cycle. Only publishing can fail it; sampling problems are
    /// already folded into zeroed fields.
    pub async fn run_cycle(&mut self) -> Result<(), PublishError> {
        self.enter(AgentPhase::Sampling);
        let usage = self.sample().await;
        debug!(?usage, "cycle sampled");

        self.enter(AgentPhase::Publishing);
        let result = self.publish(&usage).await;
        self.enter(AgentPhase::Idle);
        result
    }

    async fn sample(&mut self) -> SystemUsage {
        // The throughput window dominates the cycle; count clients meanwhile.
        let (throughput, wifi_clients) = tokio::join!(
            self.sampler.sample_throughput(&self.interface),
            self.counter.count(),
        );
        let cpu = self.sampler.sample_cpu();
        let memory = self.sampler.sample_memory();
        assemble(CycleSamples {
            cpu,
            memory,
            throughput,
            wifi_clients,
        })
    }

    async fn publish(&self, usage: &SystemUsage) -> Result<(), PublishError> {
        let payload = usage.to_json()?;
        self.publisher.publish(&self.topic, payload).await
    }
}
