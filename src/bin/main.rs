use std::{
    error::Error,
    io::{self, IsTerminal},
    path::Path,
    process::ExitCode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devstack::{
    cancel::CancelToken,
    cli::{Cli, Commands, parse_args},
    config::Context,
    logs,
    orchestrator::{LocalControllers, Orchestrator},
    report,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let cancel = CancelToken::new();
    if let Err(err) = register_signal_handler(cancel.clone()) {
        warn!("Failed to install Ctrl-C handler: {err}");
    }

    match run(args, cancel) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli, cancel: CancelToken) -> Result<u8, Box<dyn Error>> {
    let context = Context::load(Path::new(&args.config))?;
    let factory = LocalControllers::new(&context, cancel.clone());
    let orchestrator = Orchestrator::new(&context, factory, cancel);

    match args.command {
        Commands::Start { target } => {
            let started = orchestrator.start(&target)?;
            print!("{}", report::render_start(&target, &started));
        }
        Commands::Stop { target } => {
            let stopped = orchestrator.stop(&target)?;
            print!("{}", report::render_stop(&target, &stopped));
        }
        Commands::Status {
            target,
            json,
            no_color,
        } => {
            let status = orchestrator.status(&target)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let color = !no_color && io::stdout().is_terminal();
                print!("{}", report::render_status(&status, color));
            }
            return Ok(status.summary.exit_code());
        }
        Commands::Restart { target } => {
            let restarted = orchestrator.restart(&target)?;
            print!("{}", report::render_stop(&target, &restarted.stop));
            print!("{}", report::render_start(&target, &restarted.start));
        }
        Commands::Logs { service, lines } => {
            context.service(&service)?;
            info!("Fetching logs for service: {service}");
            if !logs::show_logs(context.log_dir(), &service, lines)? {
                warn!(
                    "No logs recorded for '{service}' in {}",
                    context.log_dir().display()
                );
                return Ok(1);
            }
        }
        Commands::List => print!("{}", report::render_list(&context)),
    }

    Ok(0)
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries reports (and JSON), so diagnostics go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn register_signal_handler(cancel: CancelToken) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        eprintln!("devstack: interrupt received, cancelling and rolling back...");
        cancel.cancel();
    })
}
