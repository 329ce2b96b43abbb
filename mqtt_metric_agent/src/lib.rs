//! mqtt_metric_agent: samples CPU, memory and interface throughput on a fixed
//! cadence and publishes one JSON record per cycle to an MQTT topic.

pub mod agent;
pub mod clients;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod sampler;
pub mod source;
pub mod state;
pub mod types;

pub use agent::{AgentLoop, LoopSummary};
pub use error::{ConfigError, PublishError, SampleError};
pub use types::SystemUsage;
