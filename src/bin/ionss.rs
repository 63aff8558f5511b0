//! I/O node service daemon.
//!
//! Exports one or more directories as projections and serves the RPC
//! protocol until the last attached client detaches (or a peer
//! broadcasts shutdown).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use projfs::rpc::loopback::LoopbackFabric;
use projfs::server::{ServerBase, ServerConfig, start_server};

/// Parse a size argument with an optional `k`/`m` suffix.
fn parse_size(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let (digits, multiplier) = match text.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&text[..text.len() - 1], 1024),
        Some(b'm') | Some(b'M') => (&text[..text.len() - 1], 1024 * 1024),
        _ => (text, 1),
    };
    let value: u32 = digits
        .parse()
        .map_err(|_| format!("invalid size '{text}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{text}' overflows"))
}

#[derive(Parser, Debug)]
#[command(name = "ionss", version, about = "projfs I/O node service")]
struct Args {
    /// Service group name clients attach to.
    #[arg(long, default_value = "IONSS")]
    group_name: String,

    /// Progress poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_interval: u64,

    /// Largest single read; accepts k/m suffixes.
    #[arg(long, value_parser = parse_size, default_value = "1m")]
    max_read: u32,

    /// Largest single write; accepts k/m suffixes.
    #[arg(long, value_parser = parse_size, default_value = "1m")]
    max_write: u32,

    /// Readdir reply buffer size; accepts k/m suffixes.
    #[arg(long, value_parser = parse_size, default_value = "64k")]
    readdir_size: u32,

    /// Largest payload carried inline in a reply instead of via bulk.
    #[arg(long, value_parser = parse_size, default_value = "64")]
    max_direct_read: u32,

    /// Advertise multi-threaded kernel sessions to clients.
    #[arg(long)]
    cnss_threads: bool,

    /// Service threads per rank.
    #[arg(long, default_value_t = 1)]
    thread_count: usize,

    /// Export the projections read-only.
    #[arg(long)]
    read_only: bool,

    /// Directories to export, projected as fs ids 0..N-1.
    #[arg(required = true)]
    exports: Vec<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.thread_count > 1 {
        warn!("in-process fabric serves each rank from one context; extra service threads are collapsed");
    }

    let config = ServerConfig {
        poll_interval: Duration::from_millis(args.poll_interval.max(1)),
        max_read: args.max_read,
        max_write: args.max_write,
        readdir_size: args.readdir_size,
        max_iov_read: args.max_direct_read,
        max_iov_write: args.max_direct_read,
        writeable: !args.read_only,
        cnss_threads: args.cnss_threads,
        ..ServerConfig::default()
    };

    let fabric = LoopbackFabric::new(&args.group_name);
    let base = ServerBase::new(fabric, 0, config.clone());
    for path in &args.exports {
        if let Err(err) = base.add_export(path) {
            eprintln!("ionss: cannot export {}: {err}", path.display());
            std::process::exit(1);
        }
    }

    let ctx = start_server(&base);
    info!(
        "rank {} serving {} projections in group '{}'",
        base.rank,
        base.projections().len(),
        args.group_name
    );

    let shutting_down = {
        let base = Arc::clone(&base);
        move || base.shutting_down()
    };
    while !base.shutting_down() {
        ctx.progress(config.poll_interval, Some(&shutting_down));
    }

    // Drain whatever is still queued, then leave.
    ctx.progress(Duration::ZERO, None);
    info!("rank {} stopped", base.rank);
}
