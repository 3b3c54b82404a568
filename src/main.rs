use anyhow::{ensure, Context, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tiled_seg::{Config, PredictionSource, SegmentationRunner, TiledPredictor};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let config = Config::parse();

    ensure!(
        config.source.exists(),
        "Source path does not exist: {}",
        config.source.display()
    );

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()?;

    let predictor = TiledPredictor::from_source(
        &config.model,
        config.predictor_config(),
        &config.backend_options(),
    )
    .with_context(|| format!("Failed to load model: {}", config.model))?;

    let source = PredictionSource::open(&config.source)
        .with_context(|| format!("Failed to open source: {}", config.source.display()))?;

    let runner = SegmentationRunner::new(predictor, &config.output_dir)
        .with_format(config.output_format())
        .with_encoding(config.mask_encoding);
    let written = runner.process_source(&source)?;

    info!(
        masks = written.len(),
        output_dir = %config.output_dir.display(),
        "done"
    );
    Ok(())
}
