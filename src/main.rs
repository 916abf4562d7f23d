//! nstore command line entry point

use std::path::PathBuf;
use std::process::ExitCode;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use nstore::config::Config;
use nstore::Nstore;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: nstore [-c config.yaml] [--cache] <command> <uri>...");
    eprintln!();
    eprintln!("nstore - uniform access to local files and object storage");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  cat <uri>          Write a resource to stdout");
    eprintln!("  put <uri>          Store stdin as a resource");
    eprintln!("  cp <src> <dst>     Copy a resource");
    eprintln!("  rm <uri>           Delete a resource");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c <config.yaml>   Configuration file");
    eprintln!("  --cache            Go through the local mirror cache");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  nstore -c /etc/nstore.yaml cp s3://bucket/data.csv.gz ./data.csv.gz");
}

/// Exit status for failures worth retrying (EX_TEMPFAIL)
const EXIT_RETRYABLE: u8 = 75;

enum Command {
    Cat(String),
    Put(String),
    Copy(String, String),
    Remove(String),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Cat(_) => "cat",
            Command::Put(_) => "put",
            Command::Copy(..) => "cp",
            Command::Remove(_) => "rm",
        }
    }
}

struct Args {
    config: Option<PathBuf>,
    usecache: bool,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Option<Args> {
    let mut args = args.into_iter();
    let mut config = None;
    let mut usecache = false;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => config = Some(PathBuf::from(args.next()?)),
            "--cache" => usecache = true,
            "-h" | "--help" => return None,
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match (
        positional.next()?.as_str(),
        positional.next(),
        positional.next(),
        positional.next(),
    ) {
        ("cat", Some(uri), None, None) => Command::Cat(uri),
        ("put", Some(uri), None, None) => Command::Put(uri),
        ("cp", Some(src), Some(dst), None) => Command::Copy(src, dst),
        ("rm", Some(uri), None, None) => Command::Remove(uri),
        _ => return None,
    };

    Some(Args {
        config,
        usecache,
        command,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let Some(args) = parse_args(std::env::args().skip(1)) else {
        print_usage();
        return ExitCode::FAILURE;
    };

    // Load configuration
    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    // Initialize logging; stdout carries data
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!("Loaded configuration from {:?}", args.config);

    let store = match Nstore::from_config(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to start: {}", e);
            return exit_code(&e);
        }
    };

    let outcome = run(&store, &args).await;

    // Push whatever the command left dirty, even when it failed
    let flushed = store.flush_all().await;

    match (outcome, flushed) {
        (Ok(()), Ok(())) => ExitCode::SUCCESS,
        (Err(e), _) => {
            error!("{} failed: {}", args.command.name(), e);
            exit_code(&e)
        }
        (Ok(()), Err(e)) => {
            error!("Flushing cached writes failed: {}", e);
            exit_code(&e)
        }
    }
}

fn exit_code(err: &nstore::NstoreError) -> ExitCode {
    ExitCode::from(exit_status(err))
}

fn exit_status(err: &nstore::NstoreError) -> u8 {
    if err.is_retryable() {
        EXIT_RETRYABLE
    } else {
        1
    }
}

async fn run(store: &Nstore, args: &Args) -> nstore::Result<()> {
    match &args.command {
        Command::Cat(uri) => {
            let mut handle = store.access(uri, "rb", args.usecache).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut handle, &mut stdout).await?;
            stdout.flush().await?;
            handle.close().await
        }
        Command::Put(uri) => {
            let mut handle = store.access(uri, "wb", args.usecache).await?;
            let copied = tokio::io::copy(&mut tokio::io::stdin(), &mut handle).await?;
            handle.close().await?;
            info!("Stored {} bytes at {}", copied, uri);
            Ok(())
        }
        Command::Copy(src, dst) => store.copy(src, dst).await.map(|_| ()),
        Command::Remove(uri) => store.delete(uri).await,
    }
}
