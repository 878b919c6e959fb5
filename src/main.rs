use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tracing_subscriber::EnvFilter;
use watering_reminder::app::{Options, RunError, run_with_io};
use watering_reminder::transport::bluer::BluerTransport;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr so stdout carries only state lines.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` switches this crate to debug.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "watering_reminder=debug"
    } else {
        "watering_reminder=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(options: Options) -> Result<(), RunError> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_io(options, &BluerTransport, &mut out).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Process managers watching the exit status should see panics as distinct failures
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
