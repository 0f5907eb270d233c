use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use camsync::{AppContext, Args, SystemTerminalClient, SystemZone, run_with_clients_and_log_level};

fn main() -> ExitCode {
    let args = Args::parse();
    // The local offset is only readable while the process is single-threaded.
    let zone = Arc::new(SystemZone::detect());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start the async runtime: {error}");
            return ExitCode::from(1);
        }
    };

    let run_result = runtime.block_on(async {
        let mut stdout = std::io::stdout();
        let context = AppContext::from_args(&args, zone).await?;
        let log_level = args.log_level();
        let output_format = args.output_format();
        run_with_clients_and_log_level(
            args.into_command(),
            &mut stdout,
            &SystemTerminalClient,
            context,
            log_level,
            output_format,
        )
        .await
    });

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
