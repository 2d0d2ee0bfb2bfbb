use std::{
    fs::{create_dir_all, remove_dir_all},
    iter::repeat,
    path::Path,
};

use benchmark::benchmark;
use clap::Parser;
use command_parser::*;
use log::LevelFilter;

mod benchmark;
mod command_parser;

fn main() {
    let mut app = App::parse();

    env_logger::Builder::new()
        .filter_level(if app.global_opts.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    if app.global_opts.cpus.len() != 1 && app.global_opts.cpus.len() != app.global_opts.threads.len()
    {
        log::error!(
            "--cpus takes either one value or one per --threads entry ({} given for {} thread counts)",
            app.global_opts.cpus.len(),
            app.global_opts.threads.len()
        );
        return;
    }

    if app.global_opts.cpus.len() == 1 {
        app.global_opts.cpus = repeat(app.global_opts.cpus[0])
            .take(app.global_opts.threads.len())
            .collect();
    }

    let output_path = Path::new(app.global_opts.output_path.as_str());

    if output_path.is_dir() {
        if let Err(e) = remove_dir_all(output_path) {
            log::error!("Error removing output dir: {}", e);
            return;
        }
    }

    if let Err(e) = create_dir_all(output_path) {
        log::error!("Error creating output dir: {}", e);
        return;
    }

    for (ncpu, nthread) in app
        .global_opts
        .cpus
        .iter()
        .zip(&app.global_opts.threads)
    {
        benchmark(*ncpu, *nthread, app.experiment, &app.global_opts)
    }
}
