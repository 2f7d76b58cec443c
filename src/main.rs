use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use spdlog::{info, warn};

use gitpress::config::{read_config, Config, SAMPLE_CONFIG};
use gitpress::logger::configure_logger;
use gitpress::server::server_run;

const CFG_FILE_NAME: &str = "gitpress.toml";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config path
    #[arg(short, long)]
    config_path: Option<String>,

    /// Print a commented sample configuration and exit
    #[arg(long)]
    sample_config: bool,
}

fn get_config_path() -> Option<PathBuf> {
    let exe_path = env::current_exe().unwrap();
    let exe_dir = exe_path.parent().unwrap();
    let cur_dir = env::current_dir().unwrap();

    if exe_dir.join(CFG_FILE_NAME).exists() {
        return Some(exe_dir.join(CFG_FILE_NAME));
    }

    if cur_dir.join(CFG_FILE_NAME).exists() {
        return Some(cur_dir.join(CFG_FILE_NAME));
    }

    let cfg_dir = dirs::config_dir().expect("Could not find user config dir");
    if cfg_dir.join(CFG_FILE_NAME).exists() {
        return Some(cfg_dir.join(CFG_FILE_NAME));
    }

    None
}

fn open_config(cfg_path: Option<PathBuf>) -> std::result::Result<Config, String> {
    let config_path = cfg_path.unwrap_or(match get_config_path() {
        None => return Err("Could not find a gitpress configuration".to_string()),
        Some(x) => x,
    });

    println!("Reading config from {}", config_path.to_str().unwrap());
    let config = match read_config(&config_path) {
        Ok(config) => config,
        Err(e) => return Err(e.to_string()),
    };

    match config.log.as_ref().and_then(|log| log.location.as_ref()) {
        Some(location) => {
            println!("Log enabled. Files will be written in {}", location.to_str().unwrap())
        }
        None => println!("Logging to console"),
    }

    Ok(config)
}

#[ntex::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.sample_config {
        println!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    let config_path = args.config_path.map(PathBuf::from);
    let config = match open_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            eprintln!("Please run gitpress --help");
            return Ok(());
        }
    };

    if let Err(err) = configure_logger(&config) {
        warn!("Error creating logger sinks. Using console instead. Desc={}", err);
    }

    info!("Starting gitpress =-=-=-=-=-=-=-=-=-=-=-=-=-=-=-");
    info!(
        "Serving {}/{} from github.com/{}/{}",
        config.content.root(),
        config.content.posts_dir(),
        config.github.owner,
        config.github.repo
    );
    info!("Listening on {}:{}", config.server.address, config.server.port);

    server_run(config).await?;
    Ok(())
}
