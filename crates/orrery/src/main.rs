use clap::Parser;
use log::*;
use orrery::{
    cli,
    config::EngineConfig,
    engine::Engine,
    gpu::{
        headless::{HeadlessConfig, HeadlessDevice},
        Extent2D,
    },
    VERSION,
};
use orrery_utils::AnyResult;
use std::{process, sync::Arc};

pub fn main() {
    let args = cli::Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path),
        None => Ok(EngineConfig::default()),
    };

    let mut logger = pretty_env_logger::formatted_builder();
    logger
        .format_indent(None)
        .format_timestamp(None)
        .filter_level(if args.verbose {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        });
    if let Some(filters) = config.as_ref().ok().and_then(|c| c.log.filters.as_deref()) {
        logger.parse_filters(filters);
    }
    logger.init();

    info!("Welcome to Orrery {VERSION}");

    let result = config.and_then(|mut config| {
        if let Some(scene) = args.scene {
            config.session.scene = Some(scene);
        }
        run(&config, args.frames)
    });

    if let Err(error) = result {
        error!("{error:?}");
        process::exit(1);
    }
}

fn run(config: &EngineConfig, frames: u64) -> AnyResult {
    let extent = Extent2D::new(config.window.width, config.window.height);
    let mut headless = HeadlessConfig::default();
    headless.framebuffer_size = extent;
    headless.surface_capabilities.current_extent = extent;
    let device = Arc::new(HeadlessDevice::new(headless));
    info!(
        "Opening `{}` ({}x{}) on the headless device",
        config.window.title, config.window.width, config.window.height
    );

    let mut engine = Engine::start(config, device.clone(), device)?;
    let outcome = engine.run(frames);
    engine.shutdown();
    outcome.map(|_| ())
}
