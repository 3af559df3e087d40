//! Command line program running the gridstep co-simulation coordinator.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

extern crate anyhow;
extern crate clap;
extern crate simplelog;

pub mod config;

use std::path::Path;

use anyhow::Result;
use clap::{App, Arg, ArgMatches};

use crate::config::Config;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

fn main() {
    match start(app().get_matches()) {
        Ok(_) => (),
        Err(e) => {
            eprintln!("error: {}", e);
            if e.root_cause().to_string() != e.to_string() {
                eprintln!("Caused by:\n{}", e.root_cause())
            }
            std::process::exit(1);
        }
    }
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("gridstep")
        .version(VERSION)
        .about(
            "Smart-grid co-simulation coordinator. Bridges simulator clients, \
             an external controller and a power-flow solver over TCP, \
             advancing a shared simulation clock in lockstep.",
        )
        .arg(
            Arg::with_name("verbosity")
                .long("verbosity")
                .short("v")
                .takes_value(true)
                .default_value("info")
                .value_name("verb")
                .help("Set the verbosity of the log output"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .value_name("path")
                .help("Load settings from a TOML file"),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .takes_value(true)
                .value_name("addr")
                .help("Address the listeners bind to"),
        )
        .arg(
            Arg::with_name("client-port")
                .long("client-port")
                .takes_value(true)
                .value_name("port")
                .help("Port for simulator client connections"),
        )
        .arg(
            Arg::with_name("control-port")
                .long("control-port")
                .takes_value(true)
                .value_name("port")
                .help("Port for the external controller connection"),
        )
        .arg(
            Arg::with_name("solver-port")
                .long("solver-port")
                .takes_value(true)
                .value_name("port")
                .help("Port for the power-flow solver connection"),
        )
        .arg(
            Arg::with_name("step")
                .long("step")
                .takes_value(true)
                .value_name("seconds")
                .help("Wall-clock seconds represented by one simulation step"),
        )
        .arg(
            Arg::with_name("mode")
                .long("mode")
                .takes_value(true)
                .possible_values(&["normal", "regulation"])
                .value_name("mode")
                .help("Grid operating mode"),
        )
        .arg(
            Arg::with_name("history")
                .long("history")
                .takes_value(true)
                .value_name("path")
                .help("Path of the client connection history file"),
        )
}

fn start(matches: ArgMatches) -> Result<()> {
    setup_log_verbosity(&matches);

    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_path(Path::new(path))?,
        None => Config::default(),
    };
    config.apply_matches(&matches)?;
    debug!("effective configuration: {:?}", config);

    let hub = config.into_settings().build();
    hub.start()?;

    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        std::process::exit(0);
    })?;

    info!("gridstep {} up, waiting for the controller", VERSION);
    // the simulation loop owns the main thread; an error escaping a
    // decision step is process-fatal
    hub.run()?;
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(verbosity) => match verbosity {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" => LevelFilter::Warn,
            "3" | "info" | "default" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        },
        _ => LevelFilter::Info,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Trace)
        .build();
    let _ = TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}
