use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use voxlink::app;
use voxlink::config::AppConfig;
use voxlink::registry::ResourceRegistry;
use voxlink::state::ListeningMode;

#[derive(Parser, Debug)]
#[command(name = "voxlink", about = "Voice assistant session client")]
struct Args {
    /// Listening mode: always_on, auto_stop or manual.
    #[arg(long)]
    mode: Option<String>,

    /// Disable wake word detection for this run.
    #[arg(long)]
    no_wake_word: bool,

    /// Normalized RMS threshold for the wake word detector (0.0..=1.0).
    #[arg(long)]
    wake_threshold: Option<f32>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(mode) = args.mode.as_deref() {
        config.listening_mode = ListeningMode::parse(mode)
            .with_context(|| format!("unknown listening mode '{mode}'"))?;
    }
    if args.no_wake_word {
        config.wake_word_enabled = false;
    }
    if let Some(threshold) = args.wake_threshold {
        anyhow::ensure!(
            (0.0..=1.0).contains(&threshold),
            "wake threshold must be within 0.0..=1.0, got {threshold}"
        );
        config.wake_threshold = threshold;
    }

    let registry = ResourceRegistry::new();

    // The runtime is built by hand so the emergency sweep below can run
    // after it is gone: anything a panicking task left registered still
    // gets its synchronous cleanup.
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    let result = runtime.block_on(app::run(config, Arc::clone(&registry)));
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));

    let leftovers = registry.shutdown_all_blocking();
    if leftovers.cleaned > 0 || leftovers.failed > 0 {
        log::warn!(
            "emergency sweep released {} resources ({} failed)",
            leftovers.cleaned,
            leftovers.failed
        );
    }

    result.context("session ended with an error")
}
