use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn init(level: &str) -> Result<()> {
    let level: Level = level
        .parse()
        .with_context(|| format!("invalid log level '{level}'"))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")?;
    Ok(())
}
