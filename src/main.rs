use clap::Parser;
use rt_stt::audio::capture::list_devices;
use rt_stt::config::Config;
use rt_stt::daemon::run_daemon;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "rt-stt", version, about = "Real-time speech-to-text daemon")]
struct Cli {
    /// Configuration file (default: ~/.config/rt-stt/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default)
    Run {
        /// Unix socket path, overriding the configured one
        #[arg(short, long)]
        socket: Option<PathBuf>,
        /// Suppress status output
        #[arg(short, long)]
        quiet: bool,
    },
    /// List available audio input devices
    Devices,
    /// Validate the configuration file and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    match cli.command.unwrap_or(Commands::Run {
        socket: None,
        quiet: false,
    }) {
        Commands::Run { socket, quiet } => {
            let config = match Config::load_or_default(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("rt-stt: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = run_daemon(config, socket, config_path, quiet).await {
                eprintln!("rt-stt: {}", e);
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Devices => match list_devices() {
            Ok(devices) => {
                for device in devices {
                    println!("{}", device);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("rt-stt: {}", e);
                ExitCode::FAILURE
            }
        },
        Commands::CheckConfig => match Config::load(&config_path) {
            Ok(_) => {
                println!("{}: OK", config_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("rt-stt: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
