//! drop-box upload client.
//!
//! Connects, logs in, uploads one file and logs out. The user name is
//! prompted for on stdin unless given with `--name`.

use clap::Parser;
use drop_box::client::Client;
use drop_box::config::{DEFAULT_HOST, DEFAULT_PORT};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the upload client
#[derive(Parser, Debug)]
#[command(name = "drop-box-client")]
#[command(version = "0.1.0")]
#[command(about = "Upload a file to a drop-box server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// User name to log in with
    #[arg(short, long)]
    name: Option<String>,

    /// File to upload
    #[arg(default_value = "local/file1.txt")]
    file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let name = match args.name {
        Some(name) => name,
        None => prompt_name()?,
    };

    let mut client = Client::connect((args.host.as_str(), args.port))?;
    info!(greeting = %client.greeting(), "Connected");

    client.login(&name)?;
    info!(name = %name, "Logged in");

    let sent = client.upload_file(&args.file)?;
    info!(file = %args.file.display(), bytes = sent, "Upload complete");

    client.logout()?;
    Ok(())
}

fn prompt_name() -> io::Result<String> {
    print!("Please, input your name: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let name = line.trim().to_string();
    if name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "a user name is required"));
    }
    Ok(name)
}
