use clap::Parser;
use std::path::PathBuf;

/// User-specified command line parameters
#[derive(Debug, Parser)]
#[clap(name = "Orrery", about)]
pub struct Args {
    #[clap(long, short = 'c')]
    /// Engine configuration file (TOML). Defaults are used without one.
    pub config: Option<PathBuf>,

    #[clap(long, short = 's')]
    /// Scene description to load, overriding the configured one.
    pub scene: Option<PathBuf>,

    #[clap(long, short = 'f', default_value_t = 120)]
    /// Amount of frames to present before exiting.
    pub frames: u64,

    #[clap(long, short = 'v')]
    /// Enables trace logging.
    pub verbose: bool,
}
