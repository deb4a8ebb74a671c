//! # fncached-server
//!
//! Entry point for the function-memoization cache server. Boots a
//! `Coordinator` (recovering durable state across the four logs per
//! spec.md §4.9), starts its background workers, and blocks until
//! shutdown. The RPC transport that would marshal `Coordinator`'s public
//! operations onto the wire is an external collaborator (spec.md §1) --
//! this binary only owns process lifecycle, config, and logging.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};

use fncached::{CacheConfig, Coordinator, VERSION};

struct Cli {
    debug_level: String,
    no_hits: bool,
    config_path: Option<PathBuf>,
}

fn usage() -> &'static str {
    "usage: fncached-server [-debug LEVEL] [-noHits] [-config PATH]"
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Cli, String> {
    let mut debug_level = "info".to_string();
    let mut no_hits = false;
    let mut config_path = None;

    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-debug" => {
                debug_level = args.next().ok_or_else(|| "-debug requires a LEVEL argument".to_string())?;
            }
            "-noHits" => no_hits = true,
            "-config" => {
                config_path = Some(PathBuf::from(
                    args.next().ok_or_else(|| "-config requires a PATH argument".to_string())?,
                ));
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }

    Ok(Cli { debug_level, no_hits, config_path })
}

fn load_config(cli: &Cli) -> fncached::Result<CacheConfig> {
    let mut config = match &cli.config_path {
        Some(path) => CacheConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => CacheConfig::default(),
    };
    config.no_hits = config.no_hits || cli.no_hits;
    Ok(config)
}

/// Wait for SIGINT or (on unix) SIGTERM so the shutdown path below can
/// flush every MultiPKFile before the process exits. Built on
/// `tokio::signal`, already part of the `tokio` "full" feature set this
/// crate pulls in for its async runtime.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler, waiting on SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("fncached-server: {msg}");
            eprintln!("{}", usage());
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.debug_level))
        .with_target(false)
        .init();

    info!(version = VERSION, "fncached-server starting");

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    let coordinator = match Coordinator::open(config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to open coordinator (log recovery or stable-root setup failed)");
            return ExitCode::from(2);
        }
    };

    let id = coordinator.get_cache_id();
    info!(instance_fp = %id.instance_fp, "coordinator ready; waiting for shutdown signal");

    wait_for_shutdown_signal().await;

    info!("shutdown signal received, flushing before exit");
    if let Err(e) = coordinator.flush_all() {
        error!(error = %e, "flush_all failed during shutdown");
        return ExitCode::from(2);
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_defaults() {
        let cli = parse_args(std::iter::empty()).unwrap();
        assert_eq!(cli.debug_level, "info");
        assert!(!cli.no_hits);
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn parse_args_accepts_debug_and_nohits() {
        let args = vec!["-debug".to_string(), "trace".to_string(), "-noHits".to_string()];
        let cli = parse_args(args.into_iter()).unwrap();
        assert_eq!(cli.debug_level, "trace");
        assert!(cli.no_hits);
    }

    #[test]
    fn parse_args_rejects_unknown_flag() {
        let err = parse_args(vec!["-bogus".to_string()].into_iter());
        assert!(err.is_err());
    }

    #[test]
    fn parse_args_requires_debug_value() {
        let err = parse_args(vec!["-debug".to_string()].into_iter());
        assert!(err.is_err());
    }
}
