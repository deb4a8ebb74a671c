//! # fncached-ctl
//!
//! Interactive operator console for the cache server. The wire protocol
//! a real deployment would use to reach a remote `fncached-server` is
//! out of this crate's scope (spec.md §1 "deliberately out of scope:
//! the RPC wire layer and its per-method marshalling"); this harness
//! instead opens its own embedded `Coordinator` against the same
//! stable-cache-root/log-root a server is pointed at, and drives its
//! public operations directly -- the same "core exposes operations, an
//! external layer marshals them" contract, with this binary standing in
//! as the thinnest possible marshaler, a REPL loop.

use std::io::Write;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};

use fncached::fp::Fingerprint;
use fncached::{CacheConfig, Coordinator, VERSION};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    let mut args = std::env::args().skip(1);
    let root = match args.next() {
        Some(r) => PathBuf::from(r),
        None => {
            eprintln!("usage: fncached-ctl STABLE_CACHE_ROOT");
            return std::process::ExitCode::from(1);
        }
    };

    let mut config = CacheConfig::default();
    config.stable_cache_root = root.join("cache");
    config.log_root = root.join("logs");

    let coordinator = match Coordinator::open(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fncached-ctl: failed to open cache at {}: {e}", root.display());
            return std::process::ExitCode::from(2);
        }
    };

    println!("fncached-ctl {VERSION} -- connected to {}", root.display());
    println!("commands: id | state | lookup PK EPOCH FP... | renew CI... | flush | quit");

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    loop {
        print!("fncached> ");
        let _ = std::io::stdout().flush();
        line.clear();
        let n = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                eprintln!("fncached-ctl: read error: {e}");
                return std::process::ExitCode::from(2);
            }
        };
        if n == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["id"] => {
                let id = coordinator.get_cache_id();
                println!("instance_fp = {}", id.instance_fp);
            }
            ["state"] => {
                let state = coordinator.get_cache_state();
                println!("{state:#?}");
            }
            ["renew", cis @ ..] => {
                let parsed: Result<Vec<u32>, _> = cis.iter().map(|s| s.parse()).collect();
                match parsed {
                    Ok(cis) => println!("all leased = {}", coordinator.renew_leases(&cis)),
                    Err(e) => println!("error: {e}"),
                }
            }
            ["lookup", pk, epoch, fps @ ..] => match run_lookup(&coordinator, pk, epoch, fps) {
                Ok(msg) => println!("{msg}"),
                Err(e) => println!("error: {e}"),
            },
            ["flush"] => match coordinator.flush_all() {
                Ok(()) => println!("ok"),
                Err(e) => println!("error: {e}"),
            },
            other => println!("unrecognized command: {}", other.join(" ")),
        }
    }

    std::process::ExitCode::SUCCESS
}

fn run_lookup(coordinator: &Coordinator, pk: &str, epoch: &str, fps: &[&str]) -> Result<String, String> {
    let pk = Fingerprint::of_bytes(pk.as_bytes());
    let epoch: u32 = epoch.parse().map_err(|e| format!("{e}"))?;
    let fps: Vec<Fingerprint> = fps.iter().map(|s| Fingerprint::of_bytes(s.as_bytes())).collect();
    let instance_fp = coordinator.get_cache_instance();
    match coordinator.lookup(instance_fp, pk, epoch, &fps) {
        Ok(fncached::coordinator::LookupResult::Hit { ci, value }) => {
            Ok(format!("HIT ci={ci} value={}bytes", value.len()))
        }
        Ok(fncached::coordinator::LookupResult::Miss) => Ok("MISS".to_string()),
        Ok(fncached::coordinator::LookupResult::WrongInstance) => Ok("WRONG_INSTANCE".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
