mod config;
mod error;
mod events;
mod facade;
mod mi;
mod models;
mod sourcemap;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use events::DebugEvent;
use facade::DebuggerFacade;

/// Drives one debug session from the command line. Stands in for the
/// debug-UI front end, which is out of scope for this crate: it only
/// prints the events a real UI would render and forwards typed lines on
/// stdin as `sendUserInput`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Working directory the compiler and GDB are spawned in
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// The COBOL source to compile and debug
    target: PathBuf,

    /// Additional COBOL sources compiled into the same program
    #[arg(long = "group")]
    group: Vec<PathBuf>,

    /// Compile without debug info and just run the compiler job
    #[arg(long)]
    no_debug: bool,

    /// Attach to a running gdbserver instead of compiling+launching
    #[arg(long)]
    connect: Option<String>,

    /// Executable to pass to GDB when attaching (`--connect`)
    #[arg(long)]
    executable: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "cobol-dbg-adapter.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    let config = config::Config::default();
    debug!("adapter config: {:?}", config);

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let facade = Arc::new(DebuggerFacade::new(config, events_tx));

    let cwd = std::fs::canonicalize(&args.cwd)?;
    let env = std::collections::HashMap::new();

    if let Some(target) = &args.connect {
        info!("connecting to {}", target);
        facade.connect(&cwd, args.executable.as_deref(), target, &env).await?;
    } else {
        info!("loading {}", args.target.display());
        facade.load(&cwd, &args.target, &args.group, &env, args.no_debug).await?;
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match &event {
                DebugEvent::Msg(kind, text) => print!("[{:?}] {}", kind, text),
                DebugEvent::Quit => {
                    println!("[quit]");
                    break;
                }
                other => println!("[event] {:?}", other),
            }
        }
    });

    if !args.no_debug {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        match facade.start(rx).await {
            Ok(running) => info!("exec-run resolved, running={}", running),
            Err(e) => warn!("exec-run failed: {}", e),
        }
    }

    let stdin_facade = Arc::clone(&facade);
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = stdin_facade.send_user_input(&line, None, None).await {
                        warn!("sendUserInput failed: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = printer => {}
        _ = stdin_task => {}
    }
    Ok(())
}
