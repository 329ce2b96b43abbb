//! tracing subscriber setup: `RUST_LOG` filter, UTC timestamps on stderr,
//! JSON lines when `LOG_FORMAT=json`.

use std::io;

use anyhow::{anyhow, Context};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const TIME_PATTERN: &str = "[year]-[month]-[day]T[hour repr:24]:[minute]:[second]Z";

pub fn init_logging() -> anyhow::Result<()> {
    let time_format =
        time::format_description::parse(TIME_PATTERN).context("parsing log time format")?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(UtcTime::new(time_format))
        .with_writer(io::stderr);
    let res = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| anyhow!("failed to set up logging: {e}"))
}
