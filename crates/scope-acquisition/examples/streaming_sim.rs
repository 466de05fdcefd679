//! Stream a few chunks from the simulated digitizer and print what comes
//! out of the per-channel queues.
//!
//! ```sh
//! cargo run -p scope-acquisition --example streaming_sim
//! ```

use scope_acquisition::scope_core::config::AcquisitionConfig;
use scope_acquisition::scope_core::registry::DeviceRegistry;
use scope_acquisition::{AcquisitionEngine, PollOutcome};
use scope_driver_sim::SimDigitizerFactory;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut registry = DeviceRegistry::new();
    registry.register_factory(Box::new(SimDigitizerFactory));
    let driver = registry
        .open(
            "scope0",
            "sim",
            toml::from_str("channel_count = 2\nnoise_code = 50")?,
        )
        .await?;

    let config = AcquisitionConfig::from_toml_str(
        r#"
        sample_rate = 1e6
        matcher_timeout_ns = 1000

        [[channels]]
        id = "A"

        [[channels]]
        id = "B"

        [trigger]
        source = "A"
        threshold = 1.5
        direction = "rising"
        "#,
    )?;

    let mut engine = AcquisitionEngine::new(driver, config);
    engine.start().await?;
    let mut outputs = engine.take_outputs().expect("configured engine has outputs");

    for _ in 0..4 {
        if let PollOutcome::Processed(n) = engine.poll_once().await? {
            println!("published {n} samples per channel");
        }
        for channel in &mut outputs {
            let samples = channel.samples.drain();
            let peak = samples.iter().cloned().fold(f32::MIN, f32::max);
            println!("  channel {}: {} samples, peak {peak:.3} V", channel.id, samples.len());
            for tag in channel.tags.drain() {
                println!("  channel {}: tag at {} ({:?})", channel.id, tag.index, tag.payload);
            }
        }
    }

    engine.close().await?;
    registry.close_all().await?;
    Ok(())
}
