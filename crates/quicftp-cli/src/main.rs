//! quicftp CLI
//!
//! Stream-multiplexed file transfer client and server.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use quicftp_core::{BatchReport, Client, FileTransfer, Server, TransferError};
use quicftp_files::format_bytes;
use quicftp_transport::SpoolTransport;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use config::{Config, server_endpoint};
use progress::BatchProgress;

/// quicftp - one file per stream over a multiplexed transport
#[derive(Parser)]
#[command(name = "quicftp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Spool directory shared by client and server endpoints
    #[arg(long, global = true)]
    spool_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload or download files
    Client {
        /// Server address (host[:port])
        server: String,

        /// Transfer direction
        #[arg(value_enum)]
        operation: Operation,

        /// Local files to upload, or remote paths to download
        #[arg(required = true)]
        files: Vec<String>,

        /// Client certificate
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Remote directory uploads are placed in
        #[arg(long)]
        remote_dir: Option<String>,

        /// Local directory downloads are written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Concurrent transfers
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Serve a directory
    Server {
        /// Port number to listen on
        port: u16,

        /// Path to server certificate file
        cert_path: PathBuf,

        /// Path to server private key file
        key_path: PathBuf,

        /// Root directory for file storage (default: current directory)
        root_dir: Option<PathBuf>,

        /// Disable verbose logging
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Operation {
    Upload,
    Download,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;

    init_logging(&cli, &config);
    let spool_dir = config.spool_dir(cli.spool_dir);

    match cli.command {
        Commands::Client {
            server,
            operation,
            files,
            cert,
            remote_dir,
            output_dir,
            jobs,
        } => {
            let request = ClientRequest {
                server,
                operation,
                files,
                cert,
                remote_dir,
                output_dir,
                jobs,
            };
            run_client(request, &config, spool_dir, !cli.verbose).await
        }
        Commands::Server {
            port,
            cert_path,
            key_path,
            root_dir,
            quiet,
        } => {
            let server_config = config.server_config(port, cert_path, key_path, root_dir);
            run_server(server_config, &config, spool_dir, quiet).await
        }
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    let quiet = matches!(cli.command, Commands::Server { quiet: true, .. });
    let level = if cli.verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        config.logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

struct ClientRequest {
    server: String,
    operation: Operation,
    files: Vec<String>,
    cert: Option<PathBuf>,
    remote_dir: Option<String>,
    output_dir: PathBuf,
    jobs: Option<usize>,
}

/// Connect, authenticate and run one batch
async fn run_client(
    request: ClientRequest,
    config: &Config,
    spool_dir: PathBuf,
    show_progress: bool,
) -> anyhow::Result<ExitCode> {
    let endpoint = server_endpoint(&request.server)?;
    let cert = request
        .cert
        .or_else(|| config.client.cert.clone())
        .context("No client certificate (use --cert or set [client].cert)")?;

    let local_name = format!("client-{}", std::process::id());
    let transport = SpoolTransport::bind(&spool_dir, &local_name)
        .await
        .map(|t| t.with_poll_interval(config.transport_poll_interval()))
        .context("Connection failed")?;

    let client = match Client::connect(transport, endpoint, config.client_config(request.jobs)).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Connection failed: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };
    if let Err(e) = client.authenticate(&cert).await {
        eprintln!("Authentication failed: {e}");
        return Ok(ExitCode::FAILURE);
    }

    let progress = BatchProgress::new(client.shared_registry(), show_progress);
    client.set_progress_callback(Some(progress.callback()));

    let report = match request.operation {
        Operation::Upload => {
            let files = request
                .files
                .iter()
                .map(|file| upload_entry(file, request.remote_dir.as_deref()))
                .collect::<anyhow::Result<Vec<_>>>()?;
            client.upload_files(files).await?
        }
        Operation::Download => {
            let files = request
                .files
                .iter()
                .map(|remote| download_entry(remote, &request.output_dir))
                .collect::<anyhow::Result<Vec<_>>>()?;
            client.download_files(files).await?
        }
    };

    print_report(&report, request.operation, &progress);

    if let Err(e) = client.disconnect().await {
        tracing::warn!("Disconnect failed: {}", e);
    }

    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Remote path for an upload: the file name, under `remote_dir` if given
fn upload_entry(local: &str, remote_dir: Option<&str>) -> anyhow::Result<FileTransfer> {
    let local = PathBuf::from(local);
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Cannot derive a remote name from {}", local.display()))?;
    let remote = match remote_dir.map(|d| d.trim_end_matches('/')) {
        Some(dir) if !dir.is_empty() => format!("{dir}/{name}"),
        _ => name.to_string(),
    };
    Ok(FileTransfer::new(local, remote))
}

/// Local path for a download: the remote file name inside `output_dir`
fn download_entry(remote: &str, output_dir: &Path) -> anyhow::Result<FileTransfer> {
    let name = Path::new(remote)
        .file_name()
        .with_context(|| format!("Cannot derive a local name from {remote}"))?;
    Ok(FileTransfer::new(output_dir.join(name), remote))
}

fn print_report(report: &BatchReport, operation: Operation, progress: &BatchProgress) {
    let (verb, failure) = match operation {
        Operation::Upload => ("Uploaded", "Upload failed"),
        Operation::Download => ("Downloaded", "Download failed"),
    };

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(bytes) => {
                progress.finish(outcome.stream_id, format!("{} done", outcome.file.remote));
                println!(
                    "{} {} ({})",
                    style(verb).green(),
                    outcome.file.remote,
                    format_bytes(*bytes)
                );
            }
            Err(e) => {
                progress.abandon(outcome.stream_id, format!("{} failed", outcome.file.remote));
                eprintln!("{}: {} ({})", style(failure).red(), outcome.file.remote, describe(e));
            }
        }
    }

    if report.outcomes.len() > 1 {
        println!(
            "{} of {} files, {} total",
            report.outcomes.len() - report.failures().count(),
            report.outcomes.len(),
            format_bytes(report.total_bytes())
        );
    }
}

fn describe(err: &TransferError) -> String {
    match err {
        TransferError::Remote(reason) => format!("server: {reason}"),
        other => other.to_string(),
    }
}

/// Run the server until SIGINT/SIGTERM
async fn run_server(
    server_config: quicftp_core::ServerConfig,
    config: &Config,
    spool_dir: PathBuf,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    if let Err(e) = server_config.validate() {
        eprintln!("Error: {e}");
        return Ok(ExitCode::FAILURE);
    }

    let name = format!("server-{}", server_config.port);
    let transport = SpoolTransport::bind(&spool_dir, &name)
        .await
        .map(|t| t.with_poll_interval(config.transport_poll_interval()))
        .context("Failed to start server")?;
    let inbox = transport.inbox_path().to_path_buf();

    let port = server_config.port;
    let server = match Server::start(server_config, transport).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let server_config = server.config();
    println!();
    println!("{}", style("=== quicftp server ===").bold());
    println!("Port: {port}");
    println!("Certificate: {}", server_config.cert_path.display());
    println!("Key: {}", server_config.key_path.display());
    println!("Root directory: {}", server_config.root_dir.display());
    println!("Spool inbox: {}", inbox.display());
    println!(
        "Verbose logging: {}",
        if quiet { "disabled" } else { "enabled" }
    );
    println!();
    println!("Server is running. Press Ctrl+C to stop.");
    println!();

    server.run_until(shutdown_signal()).await?;
    println!("\nShutting down...");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_client() {
        let cli = Cli::try_parse_from([
            "quicftp", "client", "localhost:4433", "upload", "a.txt", "b.txt", "--cert", "c.pem",
        ])
        .unwrap();
        match cli.command {
            Commands::Client {
                operation, files, cert, ..
            } => {
                assert!(operation == Operation::Upload);
                assert_eq!(files, vec!["a.txt", "b.txt"]);
                assert_eq!(cert, Some(PathBuf::from("c.pem")));
            }
            Commands::Server { .. } => panic!("expected client"),
        }
    }

    #[test]
    fn test_cli_parses_server() {
        let cli =
            Cli::try_parse_from(["quicftp", "server", "4433", "s.crt", "s.key", "/srv", "--quiet"])
                .unwrap();
        match cli.command {
            Commands::Server {
                port,
                root_dir,
                quiet,
                ..
            } => {
                assert_eq!(port, 4433);
                assert_eq!(root_dir, Some(PathBuf::from("/srv")));
                assert!(quiet);
            }
            Commands::Client { .. } => panic!("expected server"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["quicftp", "server", "70000", "s.crt", "s.key"]).is_err());
        assert!(Cli::try_parse_from(["quicftp", "client", "h", "sideways", "f"]).is_err());
    }

    #[test]
    fn test_upload_entry_names() {
        let entry = upload_entry("/tmp/x/report.pdf", Some("docs/")).unwrap();
        assert_eq!(entry.remote, "docs/report.pdf");
        assert_eq!(entry.local, PathBuf::from("/tmp/x/report.pdf"));

        let entry = upload_entry("report.pdf", None).unwrap();
        assert_eq!(entry.remote, "report.pdf");
        assert!(upload_entry("..", None).is_err());
    }

    #[test]
    fn test_download_entry_names() {
        let entry = download_entry("sub/dir/data.bin", Path::new("/out")).unwrap();
        assert_eq!(entry.local, PathBuf::from("/out/data.bin"));
        assert_eq!(entry.remote, "sub/dir/data.bin");
    }
}
