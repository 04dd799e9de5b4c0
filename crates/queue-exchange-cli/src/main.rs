use clap::Parser;
use queue_exchange_cli::{initialize_logging, run, Cli};
use tracing::error;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(&cli.log_level, cli.json_logs) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = run(cli, &mut out) {
        error!("CLI error: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
