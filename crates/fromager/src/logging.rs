use std::path::Path;

use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub(crate) fn setup_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let targets = Targets::new()
        .with_target("hyper", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
        .with_default(default_level);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_filter(targets.clone());

    match log_file {
        Some(log_file) => {
            let file = fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Arc::new(file.into_parts().0))
                .with_ansi(false)
                .with_filter(targets);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }
    Ok(())
}
