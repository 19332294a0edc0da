use clap::{Arg, Command};
use log::LevelFilter;
use scan_milter::milter::Milter;
use scan_milter::plugin::PluginSet;
use scan_milter::statistics::StatisticsCollector;
use scan_milter::Config;
use std::process;
use std::str::FromStr;

#[tokio::main]
async fn main() {
    let matches = Command::new("scan-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Content scanning milter running a configurable chain of scanner plugins")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/scan-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "/etc/scan-milter.yaml".to_string());
    let config = load_config(&config_path);

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config
            .as_ref()
            .ok()
            .and_then(|c| c.logging.as_ref())
            .and_then(|l| LevelFilter::from_str(&l.level).ok())
            .unwrap_or(LevelFilter::Info)
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Testing configuration...");
        println!("  Socket: {}", config.socket_path);
        println!(
            "  Address compliance: {} (on failure: {:?})",
            config.address_compliance_checker, config.address_compliance_fail_action
        );
        if config.trash_enabled() {
            println!("  Trash: {} (log: {})", config.trashdir, config.trashlog);
        } else {
            println!("  Trash: disabled");
        }
        println!("Configuration OK");
        return;
    }

    if let Err(e) = ctrlc::set_handler(|| {
        log::info!("Received shutdown signal, exiting");
        log::info!("Statistics: {}", StatisticsCollector::global().get_stats());
        process::exit(0);
    }) {
        log::warn!("Could not install signal handler: {e}");
    }

    // Scanner plugins are registered by embedding applications; the bare
    // daemon commits every message after address validation.
    let plugins = PluginSet::new();
    if plugins.is_empty() {
        log::warn!("No plugins configured, messages are passed through unscanned");
    }

    log::info!("Starting scan-milter...");
    let socket_path = config.socket_path.clone();
    let milter = Milter::new(config, plugins);
    let result = milter.run(&socket_path).await;
    log::info!("Statistics: {}", StatisticsCollector::global().get_stats());
    if let Err(e) = result {
        log::error!("Milter error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}
