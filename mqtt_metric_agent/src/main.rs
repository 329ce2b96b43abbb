//! Entry point for mqtt_metric_agent. Reads configuration, connects to the
//! broker and runs the sampling loop until SIGINT/SIGTERM.

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mqtt_metric_agent::clients::{CommandClientCounter, DisabledClientCounter, WifiClients};
use mqtt_metric_agent::config::{parse_args, AgentConfig, ArgsError};
use mqtt_metric_agent::logging::init_logging;
use mqtt_metric_agent::publisher::MqttPublisher;
use mqtt_metric_agent::sampler::RateSampler;
use mqtt_metric_agent::source::ProcfsSource;
use mqtt_metric_agent::AgentLoop;

const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let overrides = match parse_args(env::args()) {
        Ok(v) => v,
        Err(ArgsError::Help(msg)) => {
            println!("{msg}");
            return Ok(ExitCode::SUCCESS);
        }
        Err(ArgsError::Invalid(msg)) => {
            eprintln!("{msg}");
            return Ok(ExitCode::from(2));
        }
    };

    init_logging()?;

    let mut cfg = AgentConfig::from_env().context("loading configuration")?;
    cfg.apply_overrides(overrides)
        .context("applying command line overrides")?;
    info!(
        broker = %cfg.broker.host,
        port = cfg.broker.port,
        username = %cfg.broker.username,
        topic = %cfg.topic,
        iface = %cfg.interface,
        interval_secs = cfg.interval.as_secs(),
        wifi_clients = cfg.wifi.enabled,
        "starting mqtt metric agent"
    );

    let (publisher, driver) = MqttPublisher::connect(&cfg.broker, cfg.publish_timeout)
        .await
        .context("connecting to broker")?;

    let counter = if cfg.wifi.enabled {
        WifiClients::Command(CommandClientCounter::new(
            cfg.wifi.command.clone(),
            cfg.wifi.timeout,
        ))
    } else {
        WifiClients::Disabled(DisabledClientCounter)
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut agent = AgentLoop::new(
        RateSampler::new(ProcfsSource::default()),
        counter,
        publisher,
        cfg.topic.clone(),
        cfg.interface.clone(),
        cfg.interval,
    );
    agent.run(cancel).await;

    agent.publisher().disconnect().await;
    if tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, driver)
        .await
        .is_err()
    {
        warn!("broker connection did not close in time");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, only Ctrl-C stops the agent");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown requested");
    cancel.cancel();
}
