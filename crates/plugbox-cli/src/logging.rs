use plugbox::TRACE_TARGET_PLUGIN;
use tracing::Level;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() -> anyhow::Result<()> {
    let envfilter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env()?
        .add_directive(format!("{TRACE_TARGET_PLUGIN}=debug").parse()?);

    tracing_subscriber::Registry::default()
        .with(tracing_subscriber::fmt::Layer::default().with_filter(envfilter))
        .try_init()?;
    Ok(())
}
