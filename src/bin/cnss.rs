//! Compute node system service.
//!
//! Runs the full projection stack in one process: the exported
//! directories are served by in-process server ranks over the loopback
//! fabric, the client side attaches and mounts each projection under the
//! prefix, and the control filesystem appears at `<prefix>/.ctrl`. A
//! networked fabric slots into the same seams for split deployments.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use projfs::client::dispatch::CnssFuse;
use projfs::client::ClientService;
use projfs::ctrl::{CtrlTree, fs::CtrlFs};
use projfs::rpc::loopback::LoopbackFabric;
use projfs::rpc::progress::ProgressThread;
use projfs::server::{ServerBase, ServerConfig, start_server};

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
#[command(name = "cnss", version, about = "projfs compute node service")]
struct Args {
    /// Service group name.
    #[arg(long, default_value = "IONSS")]
    group_name: String,

    /// Directory the projections and the control fs mount under.
    #[arg(long, env = "CNSS_PREFIX")]
    prefix: PathBuf,

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

    /// Largest payload carried inline instead of via bulk.
    #[arg(long, value_parser = parse_size, default_value = "64")]
    max_direct_read: u32,

    /// Export the projections read-only.
    #[arg(long)]
    read_only: bool,

    /// Directories to project, fs ids 0..N-1.
    #[arg(required = true)]
    exports: Vec<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        poll_interval: Duration::from_millis(args.poll_interval.max(1)),
        max_read: args.max_read,
        max_write: args.max_write,
        readdir_size: args.readdir_size,
        max_iov_read: args.max_direct_read,
        max_iov_write: args.max_direct_read,
        writeable: !args.read_only,
        ..ServerConfig::default()
    };

    // Colocated server rank serving the exports.
    let fabric = LoopbackFabric::new(&args.group_name);
    let base = ServerBase::new(fabric.clone(), 0, config.clone());
    for path in &args.exports {
        if let Err(err) = base.add_export(path) {
            error!("cannot export {}: {err}", path.display());
            std::process::exit(1);
        }
    }
    let server_ctx = start_server(&base);
    let server_thread = ProgressThread::start(
        "ionss-0",
        Arc::clone(&server_ctx),
        config.poll_interval,
        Vec::new(),
    );

    let service = match ClientService::attach(fabric) {
        Ok(service) => service,
        Err(err) => {
            error!("attach failed: {err}");
            std::process::exit(1);
        }
    };

    // Control filesystem with the shutdown trigger.
    let stop = Arc::new(AtomicBool::new(false));
    let tree = CtrlTree::new();
    let stop2 = Arc::clone(&stop);
    if let Err(errno) = service.register_ctrl(
        &tree,
        Arc::new(move || {
            info!("shutdown requested through ctrl fs");
            stop2.store(true, Ordering::Release);
        }),
    ) {
        error!("ctrl fs registration failed: errno {errno}");
        std::process::exit(1);
    }

    let ctrl_dir = args.prefix.join(".ctrl");
    if let Err(err) = std::fs::create_dir_all(&ctrl_dir) {
        error!("cannot create {}: {err}", ctrl_dir.display());
        std::process::exit(1);
    }
    let _ctrl_session = match CtrlFs::mount(Arc::clone(&tree), &ctrl_dir) {
        Ok(session) => session,
        Err(err) => {
            error!("ctrl fs mount failed: {err}");
            std::process::exit(1);
        }
    };
    info!("control fs mounted at {}", ctrl_dir.display());

    let mut sessions = Vec::new();
    for projection in &service.projections {
        let mount_point = args.prefix.join(&projection.mount_dir);
        if let Err(err) = std::fs::create_dir_all(&mount_point) {
            error!("cannot create {}: {err}", mount_point.display());
            std::process::exit(1);
        }
        match CnssFuse::mount(Arc::clone(projection), &mount_point) {
            Ok(session) => {
                info!(
                    "projection {} mounted at {}",
                    projection.fs_id,
                    mount_point.display()
                );
                sessions.push(session);
            }
            Err(err) => {
                error!("mount of {} failed: {err}", mount_point.display());
                std::process::exit(1);
            }
        }
    }

    while !stop.load(Ordering::Acquire) && !base.shutting_down() {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("unmounting and detaching");
    drop(sessions);
    service.detach();
    server_thread.stop_and_join();
}
