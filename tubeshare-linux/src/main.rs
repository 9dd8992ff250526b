// Tubeshare Linux host: library provider and browser over a bridged stream tube socket.

mod browser;
mod config;
mod executor;
mod files;
mod integrity;
mod protocol;
mod provider;
mod wire;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: tubeshare serve --library <file.json> [--socket <path>]
       tubeshare browse [--socket <path>] [--output <file.jsonl>]
       tubeshare download [--socket <path>] --dest <dir> <track-id>...
       tubeshare --version";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Version,
    Serve {
        library: PathBuf,
        socket: Option<PathBuf>,
    },
    Browse {
        socket: Option<PathBuf>,
        output: Option<PathBuf>,
    },
    Download {
        socket: Option<PathBuf>,
        dest: PathBuf,
        ids: Vec<String>,
    },
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Command> {
    let mut args = args.into_iter();
    let mode = match args.next() {
        Some(m) => m,
        None => bail!(USAGE),
    };
    if mode == "--version" || mode == "-V" {
        return Ok(Command::Version);
    }
    let mut library = None;
    let mut socket = None;
    let mut output = None;
    let mut dest = None;
    let mut ids = Vec::new();
    while let Some(flag) = args.next() {
        let slot = match (mode.as_str(), flag.as_str()) {
            ("serve", "--library") => &mut library,
            (_, "--socket") => &mut socket,
            ("browse", "--output") => &mut output,
            ("download", "--dest") => &mut dest,
            (_, "--version" | "-V") => return Ok(Command::Version),
            ("download", id) if !id.starts_with('-') => {
                ids.push(id.to_string());
                continue;
            }
            _ => bail!("unexpected argument {}\n{}", flag, USAGE),
        };
        match args.next() {
            Some(v) => *slot = Some(PathBuf::from(v)),
            None => bail!("{} needs a value", flag),
        }
    }
    match mode.as_str() {
        "serve" => match library {
            Some(library) => Ok(Command::Serve { library, socket }),
            None => bail!("serve needs --library\n{}", USAGE),
        },
        "browse" => Ok(Command::Browse { socket, output }),
        "download" => match dest {
            Some(dest) if !ids.is_empty() => Ok(Command::Download { socket, dest, ids }),
            _ => bail!("download needs --dest and at least one track id\n{}", USAGE),
        },
        other => bail!("unknown mode {}\n{}", other, USAGE),
    }
}

fn main() -> anyhow::Result<()> {
    let command = parse_args(std::env::args().skip(1))?;
    if command == Command::Version {
        println!("tubeshare {}", VERSION);
        return Ok(());
    }

    let cfg = config::load()?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    tracing::debug!(event = "config_loaded", config = ?cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match command {
            Command::Serve { library, socket } => {
                let library = provider::Library::load(&library)?;
                let socket = socket.unwrap_or_else(|| cfg.library_socket());
                let provider = provider::Provider::new(library, cfg.file_dir());
                tokio::select! {
                    r = provider::serve(provider, socket.clone()) => r?,
                    r = shutdown_signal() => {
                        r?;
                        let _ = std::fs::remove_file(&socket);
                    }
                }
            }
            Command::Browse { socket, output } => {
                let socket = socket.unwrap_or_else(|| cfg.library_socket());
                let stream = tokio::net::UnixStream::connect(&socket)
                    .await
                    .with_context(|| format!("connecting to {}", socket.display()))?;
                let out: Box<dyn std::io::Write + Send> = match &output {
                    Some(path) => Box::new(std::io::BufWriter::new(
                        std::fs::File::create(path)
                            .with_context(|| format!("creating {}", path.display()))?,
                    )),
                    None => Box::new(std::io::stdout()),
                };
                let opts = browser::Options {
                    chunk_length: cfg.chunk_length,
                    max_downloads: cfg.max_downloads,
                };
                tokio::select! {
                    r = browser::browse(stream, opts, Arc::new(Mutex::new(out))) => {
                        for (path, n) in r?.records {
                            tracing::info!(event = "received", path = %path, records = n);
                        }
                    }
                    r = shutdown_signal() => r?,
                }
            }
            Command::Download { socket, dest, ids } => {
                let socket = socket.unwrap_or_else(|| cfg.library_socket());
                let stream = tokio::net::UnixStream::connect(&socket)
                    .await
                    .with_context(|| format!("connecting to {}", socket.display()))?;
                let opts = files::FetchOptions {
                    max_downloads: cfg.max_downloads,
                    dest,
                };
                tokio::select! {
                    r = files::download(stream, ids, opts) => {
                        let summary = r?;
                        if !summary.failed.is_empty() {
                            bail!("failed to fetch {}", summary.failed.join(", "));
                        }
                    }
                    r = shutdown_signal() => r?,
                }
            }
            Command::Version => {}
        }
        anyhow::Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!(event = "shutdown");
    Ok(())
}
