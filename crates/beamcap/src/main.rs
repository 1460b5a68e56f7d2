use clap::Parser;
use log::LevelFilter;

mod app;
mod cli;
mod simulate;

use cli::Args;

fn main() {
    let args = Args::parse();
    log_setup(&args);

    if let Err(err) = app::run(&args) {
        eprintln!("beamcap: {err:#}");
        std::process::exit(1);
    }
}

fn log_setup(args: &Args) {
    if std::env::var_os("RUST_LOG").is_some() {
        pretty_env_logger::init();
        return;
    }

    let log_filter = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder()
        .filter_module("speadrx", log_filter)
        .filter_module("beamcap", log_filter)
        .init();
}
