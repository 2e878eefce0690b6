//! firebreak-guest: the in-guest executor daemon.
//!
//! Runs inside a sandbox VM, accepts executor connections on the guest
//! side of the host↔guest stream, and serves framed call and install
//! requests until terminated. One connection is one serve loop; the
//! host opens exactly one stream per VM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use firebreak_core::codec::Value;
use firebreak_core::executor::{
    self, ExecutorHost, FunctionRegistry, Installer, RemoteFailure,
};
use tokio::net::{TcpListener, UnixListener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// firebreak in-guest executor daemon.
#[derive(Parser, Debug)]
#[command(name = "firebreak-guest")]
#[command(about = "In-guest executor daemon for firebreak sandboxes")]
#[command(version)]
struct Cli {
    /// Listen address: `host:port` for TCP or `unix:/path` for a Unix
    /// socket.
    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: String,

    /// Budget for one dependency installation, in seconds.
    #[arg(long, default_value_t = 300)]
    install_timeout_secs: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let host = ExecutorHost::new(
        builtin_registry(),
        Arc::new(PackageInstaller {
            timeout: Duration::from_secs(cli.install_timeout_secs),
        }),
    );

    info!(listen = %cli.listen, "executor daemon starting");
    if let Some(path) = cli.listen.strip_prefix("unix:") {
        serve_unix(PathBuf::from(path), host).await
    } else {
        serve_tcp(&cli.listen, host).await
    }
}

async fn serve_tcp(addr: &str, host: ExecutorHost) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                info!(%peer, "executor connection");
                let host = host.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor::serve(stream, host).await {
                        warn!(error = %e, "executor connection ended with error");
                    }
                });
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            },
        }
    }
}

async fn serve_unix(path: PathBuf, host: ExecutorHost) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(&path).context("failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("cannot bind {}", path.display()))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept failed")?;
                info!("executor connection");
                let host = host.clone();
                tokio::spawn(async move {
                    if let Err(e) = executor::serve(stream, host).await {
                        warn!(error = %e, "executor connection ended with error");
                    }
                });
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                let _ = std::fs::remove_file(&path);
                return Ok(());
            },
        }
    }
}

/// Functions every guest image serves out of the box.
fn builtin_registry() -> Arc<FunctionRegistry> {
    let registry = Arc::new(FunctionRegistry::new());
    registry.register("guest:ping", |_args, _kwargs| Ok(Value::Str("pong".into())));
    registry.register("guest:echo", |mut args, _kwargs| {
        if args.len() == 1 {
            Ok(args.remove(0))
        } else {
            Ok(Value::Seq(args))
        }
    });
    registry
}

/// Installs packages with `uv`, falling back to `pip`.
struct PackageInstaller {
    timeout: Duration,
}

impl PackageInstaller {
    async fn run_tool(
        &self,
        program: &str,
        args: &[&str],
        dependencies: &[String],
    ) -> std::io::Result<std::process::Output> {
        let mut command = tokio::process::Command::new(program);
        command.args(args).args(dependencies).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("install did not finish within {:?}", self.timeout),
            )),
        }
    }
}

#[async_trait]
impl Installer for PackageInstaller {
    async fn install(&self, dependencies: &[String]) -> Result<(), RemoteFailure> {
        if dependencies.is_empty() {
            return Ok(());
        }
        info!(?dependencies, "installing dependencies");

        // uv first; pip only when uv is not on the image.
        let output = match self
            .run_tool("uv", &["pip", "install", "--system", "--no-progress"], dependencies)
            .await
        {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("uv unavailable, falling back to pip");
                self.run_tool(
                    "pip",
                    &["install", "--disable-pip-version-check", "--no-input"],
                    dependencies,
                )
                .await
            },
            other => other,
        };

        let output = output
            .map_err(|e| RemoteFailure::new("InstallError", format!("install failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail: String = stderr.chars().take(500).collect();
            return Err(RemoteFailure::new(
                "InstallError",
                format!("installer exited with {}: {detail}", output.status),
            ));
        }

        info!(?dependencies, "dependencies installed");
        Ok(())
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("firebreak_guest=info,firebreak_core=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
