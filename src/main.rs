use clap::{Parser, Subcommand};
use log::error;

#[derive(Parser)]
#[command(name = "maild")]
#[command(about = "A multi-server SMTP receiver with live-reconfigurable servers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon and serve until a shutdown signal arrives
    Serve {
        /// Path to the JSON configuration file
        #[arg(long, default_value = "config.json")]
        config: String,

        /// Override the configured pid file path
        #[arg(long = "pidFile")]
        pid_file: Option<String>,

        /// Force debug-level logging regardless of the configured log level
        #[arg(long)]
        verbose: bool,
    },

    /// Print the crate version and exit
    Version,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();
    match args.command {
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        Command::Serve {
            config,
            pid_file,
            verbose,
        } => {
            if let Err(e) = maild::run(config, pid_file, verbose).await {
                error!("Application error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
