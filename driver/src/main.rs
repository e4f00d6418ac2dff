use aqueduct::driver::media_driver::MediaDriver;
use bedrock::logging;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::time::Duration;

mod config;

use config::DriverConfig;

fn main() {
    let matches = Command::new("aqueductd")
        .about("Aqueduct media driver")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("dir")
                .short('d')
                .long("dir")
                .value_name("DIR")
                .help("Driver directory override"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("Log level (trace, debug, info, warning, error)"),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Print the effective configuration and exit"),
        )
        .get_matches();

    let log = match logging::term_logger(matches.get_one::<String>("log-level").unwrap()) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("failed to build logger: {}", err);
            std::process::exit(1);
        }
    };

    let config = match matches.get_one::<String>("config") {
        Some(path) => match DriverConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(log, "failed to load configuration";
                                "context" => "main",
                                "path" => %path,
                                "error" => %err);
                std::process::exit(1);
            }
        },
        None => DriverConfig::default(),
    };

    let mut ctx = config.into_context();
    if let Some(dir) = matches.get_one::<String>("dir") {
        ctx.driver_dir = PathBuf::from(dir);
    }

    if matches.get_flag("print-config") {
        println!("{:#?}", ctx);
        return;
    }

    let mut driver = match MediaDriver::launch(ctx, &log) {
        Ok(driver) => driver,
        Err(err) => {
            logging::error!(log, "driver failed to launch";
                            "context" => "main",
                            "error" => ?err);
            std::process::exit(1);
        }
    };

    logging::info!(log, "driver running";
                   "context" => "main",
                   "cnc" => %driver.cnc().path().display());

    while !driver.should_terminate() {
        std::thread::sleep(Duration::from_millis(100));
    }

    logging::info!(log, "termination requested, closing"; "context" => "main");
    driver.close();
}
