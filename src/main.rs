//! Entry point for the `procsup` binary: parse arguments, load the run file,
//! bring up logging and hand over to the supervision engine.

use std::error::Error;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use procsup::cli::Cli;
use procsup::config::Config;
use procsup::logging;
use procsup::supervisor::Supervisor;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match _main(cli) {
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    }
}

/// The actual main function, separated from [main] so errors propagate with
/// `?` and get printed once, in plain form.
fn _main(cli: Cli) -> Result<(), Box<dyn Error>> {
    let input = std::fs::read_to_string(&cli.config)
        .map_err(|err| format!("unable to read `{}`: {err}", cli.config.display()))?;
    let config = Config::from_yaml(&input)?;

    if cli.check {
        println!("{} ok: {} service(s)", cli.config.display(), config.run.len());
        return Ok(());
    }

    // the guard flushes the file appender on drop; keep it until exit
    let _logger_guard = logging::try_init(&config.log)?;
    info!(services = config.run.len(), "starting supervisor");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(Supervisor::new(config).run())?;

    info!("supervisor exited");
    Ok(())
}
