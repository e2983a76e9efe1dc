//! Fetches a single http, https or ftp resource and writes its body to
//! stdout or a file, printing the response metadata to stderr.
//!
//! Proxies are taken from the usual environment variables unless `--proxy`
//! or `--no-proxy` is given.
use anyhow::Context;
use clap::Parser;
use openuri::{OpenOptions, Opener, ProxyOption, SslVerifyMode};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "fetch")]
struct Cli {
    /// URI to open.
    pub uri: String,

    /// File to write the body to; stdout when omitted.
    #[clap(long, short)]
    pub output: Option<PathBuf>,

    /// HTTP proxy to use instead of the environment's.
    #[clap(long, conflicts_with = "no_proxy")]
    pub proxy: Option<String>,

    /// Ignore proxy settings in the environment.
    #[clap(long)]
    pub no_proxy: bool,

    /// `user:password` for HTTP basic authentication.
    #[clap(long)]
    pub user: Option<String>,

    /// PEM file or directory of trusted CA certificates.
    #[clap(long)]
    pub ca_cert: Option<PathBuf>,

    /// Skip certificate chain validation.
    #[clap(long)]
    pub insecure: bool,

    /// Use active mode for FTP data connections.
    #[clap(long)]
    pub ftp_active: bool,

    /// Read timeout in seconds.
    #[clap(long)]
    pub timeout: Option<f64>,

    /// Print download progress to stderr.
    #[clap(long)]
    pub progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Cli::parse();

    let mut options = OpenOptions::from_env()?;
    if let Some(proxy) = args.proxy {
        options = options.with_proxy(ProxyOption::Uri(proxy));
    } else if args.no_proxy {
        options = options.with_proxy(ProxyOption::Disabled);
    }
    if let Some(user) = args.user {
        let (name, password) = user.split_once(':').unwrap_or((user.as_str(), ""));
        options = options.with_basic_auth(name, password);
    }
    if let Some(ca) = args.ca_cert {
        options = options.with_ca_cert(ca);
    }
    if args.insecure {
        options = options.with_verify_mode(SslVerifyMode::VerifyNone);
    }
    if let Some(secs) = args.timeout {
        options = options.with_read_timeout(Some(Duration::from_secs_f64(secs)));
    }
    if args.progress {
        options = options
            .with_content_length_proc(|len| match len {
                Some(len) => eprintln!("expecting {len} bytes"),
                None => eprintln!("size unknown"),
            })
            .with_progress_proc(|n| eprint!("\r{n} bytes"));
    }
    options = options.with_ftp_active_mode(args.ftp_active);

    let handle = Opener::new(options)
        .open(&args.uri)
        .await
        .with_context(|| format!("opening {}", args.uri))?;
    if args.progress {
        eprintln!();
    }

    info!(
        "{} {} ({}, charset {})",
        handle.status().code(),
        handle.status().message(),
        handle.content_type(),
        handle.charset()
    );
    if let Some(base) = handle.base_uri() {
        info!("base URI: {base}");
    }
    if let Some(modified) = handle.last_modified() {
        info!("last modified: {modified}");
    }

    match args.output {
        Some(path) => std::fs::write(&path, handle.bytes())
            .with_context(|| format!("writing {}", path.display()))?,
        None => std::io::stdout().write_all(handle.bytes())?,
    }
    Ok(())
}
