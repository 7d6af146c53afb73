//! termshare - share a terminal session over SSH

use clap::Parser;

use termshare::cli::exit_code::ExitCode;
use termshare::cli::{Cli, Commands, SessionCommand};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    termshare::logging::init(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Serve(args) => termshare::cli::commands::serve::execute(cli.config, args).await,
        Commands::Session(command) => match command {
            SessionCommand::List(args) => termshare::cli::commands::session::list(args).await,
            SessionCommand::Info(args) => termshare::cli::commands::session::info(args).await,
            SessionCommand::Current(args) => {
                termshare::cli::commands::session::current(args).await
            }
        },
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from_error(&e).into()
        }
    }
}
