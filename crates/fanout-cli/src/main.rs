use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use fanout_core::{
    net, progress_channel, Dispatcher, Listener, ListenerHandle, ListenerSummary, ProgressUpdate,
    ReceiverLog, SessionEvent, TransferConfig, TransferRequest, WireFormat, RECEIVER_LOG_TARGET,
};
use storage::{LocalStorage, PathPolicy};

#[derive(Parser, Debug)]
#[command(name = "fanout", version, about = "Send one file to many receivers over TCP")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// JSON config file (defaults to <config dir>/fanout/config.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a file to one or more receivers
    Send {
        /// File to send
        #[arg(long)]
        file: PathBuf,

        /// Receiver address (ip, host, ip:port, host:port); repeat for more
        #[arg(long = "target", required = true)]
        targets: Vec<String>,

        /// Port used for targets given without one
        #[arg(long)]
        port: Option<u16>,

        /// Handshake format: framed or legacy
        #[arg(long)]
        wire_format: Option<WireFormat>,

        /// Output progress as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Listen for incoming transfers
    Listen {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Output directory for received files
        #[arg(long)]
        output: Option<PathBuf>,

        /// Handshake format: framed or legacy
        #[arg(long)]
        wire_format: Option<WireFormat>,

        /// How announced filenames map into the output directory: confine or verbatim
        #[arg(long)]
        path_policy: Option<PathPolicy>,
    },

    /// Show local addresses and the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The listener prints its feed directly, so keep it out of the log output
    let filter = match cli.cmd {
        Commands::Listen { .. } => format!("{},{}=off", cli.log_level, RECEIVER_LOG_TARGET),
        _ => cli.log_level.clone(),
    };
    fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Commands::Send {
            file,
            targets,
            port,
            wire_format,
            json,
        } => {
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(format) = wire_format {
                cfg.wire_format = format;
            }

            let failed = send_file(cfg, &file, targets, json).await?;
            if failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Listen {
            host,
            port,
            output,
            wire_format,
            path_policy,
        } => {
            if let Some(host) = host {
                cfg.listen_host = host;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            if let Some(output) = output {
                cfg.save_dir = output;
            }
            if let Some(format) = wire_format {
                cfg.wire_format = format;
            }
            if let Some(policy) = path_policy {
                cfg.path_policy = policy;
            }

            listen_for_transfers(cfg).await?;
        }

        Commands::Info => {
            let ips = net::list_interface_ips()?;
            println!("Network interfaces:");
            for item in &ips {
                let tag = if item.is_loopback { " (loopback)" } else { "" };
                println!("  {}: {}{}", item.name, item.ip, tag);
            }
            println!("  Your IP address: {}", net::local_ip());
            println!("Effective config:");
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fanout").join("config.json"))
}

/// An explicit path must exist; the default location is optional.
fn load_config(path: Option<&Path>) -> Result<TransferConfig> {
    let cfg_path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(TransferConfig::default()),
        },
    };

    let cfg_json = std::fs::read_to_string(&cfg_path)
        .with_context(|| format!("Failed to read config {}", cfg_path.display()))?;
    let cfg: TransferConfig = serde_json::from_str(&cfg_json)
        .with_context(|| format!("Invalid config {}", cfg_path.display()))?;
    tracing::debug!("Loaded config from {}", cfg_path.display());
    Ok(cfg)
}

/// Returns the number of targets that did not complete.
async fn send_file(cfg: TransferConfig, file: &Path, targets: Vec<String>, json: bool) -> Result<usize> {
    let request = TransferRequest::new(file, targets)
        .with_context(|| format!("Cannot send {}", file.display()))?;

    if !json {
        println!(
            "Sending {} ({} bytes) to {} target(s)",
            request.filename(),
            request.size(),
            request.targets().len()
        );
    }

    let dispatcher = Dispatcher::new(cfg);
    let (tx, mut rx) = progress_channel();
    let dispatch = dispatcher.dispatch(request, tx);

    let cancel = dispatcher.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling transfers");
            cancel.cancel();
        }
    });

    // Closes once every session has finished
    while let Some(update) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&update)?);
        } else if let Some(line) = render_update(&update) {
            println!("{}", line);
        }
    }

    let results = dispatch.wait_all().await;
    let failed = results.iter().filter(|(_, res)| res.is_err()).count();
    if !json {
        println!("{} of {} target(s) completed", results.len() - failed, results.len());
    }
    Ok(failed)
}

/// Human-readable status line; `None` for progress updates without a new rate sample.
fn render_update(update: &ProgressUpdate) -> Option<String> {
    let target = &update.target;
    match &update.event {
        SessionEvent::State { state } => Some(format!("  {}: {}", target, state)),
        SessionEvent::Progress {
            sent,
            total,
            percent,
            rate: Some(rate),
        } => Some(format!(
            "  {}: {}% ({}/{} bytes, {:.1} KB/s)",
            target,
            percent,
            sent,
            total,
            rate / 1024.0
        )),
        SessionEvent::Progress { rate: None, .. } => None,
        SessionEvent::Completed { sent, elapsed_secs } => Some(format!(
            "✓ {}: Completed, {} bytes in {:.1}s",
            target, sent, elapsed_secs
        )),
        SessionEvent::Failed { cause, detail, .. } => {
            tracing::debug!("{}: {}", target, detail);
            Some(format!("✗ {}: Failed: {}", target, cause))
        }
    }
}

async fn listen_for_transfers(cfg: TransferConfig) -> Result<()> {
    cfg.ensure_save_dir()?;
    let storage = LocalStorage::new(cfg.save_dir.clone(), cfg.path_policy)?;
    let save_dir = cfg.save_dir.clone();

    let (log, mut lines) = ReceiverLog::channel();
    let handle = Listener::bind(cfg, storage, log)
        .await
        .context("Failed to start listener")?
        .spawn()?;

    println!("✓ Listening on {}", handle.local_addr());
    println!("  Your IP address: {}", net::local_ip());
    println!("  Output directory: {}", save_dir.display());
    println!("  Press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => println!("{}", line),
                // Listener and all workers are gone
                None => break,
            },
            _ = &mut ctrl_c => {
                println!("Shutting down, waiting for in-flight transfers...");
                break;
            }
        }
    }

    let second_ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let summary = stop_listener(handle, &mut lines, second_ctrl_c).await?;

    println!(
        "Accepted {} connection(s): {} complete, {} short, {} failed",
        summary.accepted, summary.completed, summary.short, summary.failed
    );
    Ok(())
}

/// Graceful shutdown that turns into an abort once `interrupt` completes.
/// Feed lines keep printing until the listener is gone.
async fn stop_listener<F>(
    handle: ListenerHandle,
    lines: &mut mpsc::UnboundedReceiver<String>,
    interrupt: F,
) -> Result<ListenerSummary>
where
    F: Future<Output = ()>,
{
    let abort = handle.abort_token();
    let stopping = handle.shutdown();
    tokio::pin!(stopping);
    tokio::pin!(interrupt);

    let summary = loop {
        tokio::select! {
            res = &mut stopping => break res,
            Some(line) = lines.recv() => println!("{}", line),
            _ = &mut interrupt, if !abort.is_cancelled() => {
                println!("Cancelling in-flight transfers...");
                abort.cancel();
            }
        }
    };

    while let Ok(line) = lines.try_recv() {
        println!("{}", line);
    }
    Ok(summary?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_send_args() {
        let cli = Cli::try_parse_from([
            "fanout",
            "send",
            "--file",
            "a.bin",
            "--target",
            "10.0.0.2",
            "--target",
            "10.0.0.3:6000",
            "--wire-format",
            "legacy",
        ])
        .unwrap();

        match cli.cmd {
            Commands::Send {
                targets,
                wire_format,
                json,
                ..
            } => {
                assert_eq!(targets, vec!["10.0.0.2", "10.0.0.3:6000"]);
                assert_eq!(wire_format, Some(WireFormat::Legacy));
                assert!(!json);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_target() {
        assert!(Cli::try_parse_from(["fanout", "send", "--file", "a.bin"]).is_err());
    }

    #[test]
    fn test_listen_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["fanout", "listen", "--path-policy", "anywhere"]).is_err());
        let cli = Cli::try_parse_from(["fanout", "listen", "--path-policy", "verbatim"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Commands::Listen {
                path_policy: Some(PathPolicy::Verbatim),
                ..
            }
        ));
    }

    #[test]
    fn test_load_config_file() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{ "port": 7000, "wire_format": "legacy" }"#)?;

        let cfg = load_config(Some(&path))?;
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.wire_format, WireFormat::Legacy);
        assert_eq!(cfg.chunk_size, 4096);

        assert!(load_config(Some(&temp.path().join("missing.json"))).is_err());
        Ok(())
    }

    #[test]
    fn test_render_skips_unsampled_progress() {
        let quiet = ProgressUpdate {
            target: "10.0.0.2:5000".into(),
            event: SessionEvent::Progress {
                sent: 4096,
                total: 8192,
                percent: 50,
                rate: None,
            },
        };
        assert_eq!(render_update(&quiet), None);

        let failed = ProgressUpdate {
            target: "10.0.0.2:5000".into(),
            event: SessionEvent::Failed {
                state: fanout_core::SessionState::Connecting,
                cause: "connection refused".into(),
                detail: "connection refused by peer".into(),
            },
        };
        assert_eq!(
            render_update(&failed).as_deref(),
            Some("✗ 10.0.0.2:5000: Failed: connection refused")
        );
    }

    #[tokio::test]
    async fn test_interrupt_aborts_stalled_shutdown() -> Result<()> {
        use fanout_core::handshake::{Ack, Codec};
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        let temp = TempDir::new()?;
        let cfg = TransferConfig {
            listen_host: "127.0.0.1".into(),
            io_timeout_ms: None,
            ..TransferConfig::default()
        }
        .with_port(0)
        .with_save_dir(temp.path().join("in"));
        let storage = LocalStorage::new(cfg.save_dir.clone(), cfg.path_policy)?;
        let (log, mut lines) = ReceiverLog::channel();
        let handle = Listener::bind(cfg, storage, log).await?.spawn()?;

        // A sender that goes quiet after the filename ack
        let codec = Codec::new(WireFormat::Framed, None, CancellationToken::new());
        let mut stalled = tokio::net::TcpStream::connect(handle.local_addr()).await?;
        codec.send_filename(&mut stalled, "stuck.bin").await?;
        codec.expect_ack(&mut stalled, Ack::Filename).await?;

        let interrupt = tokio::time::sleep(Duration::from_millis(100));
        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            stop_listener(handle, &mut lines, interrupt),
        )
        .await??;

        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.failed, 1);
        drop(stalled);
        Ok(())
    }
}
