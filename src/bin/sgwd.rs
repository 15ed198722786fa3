use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use sgw::cli::GatewayOpts;
use sgw::heartbeat;
use sgw::migration::ScriptLauncher;
use sgw::net::{self, HandoffPipe};
use sgw::worker::{self, Gateway, Worker, WorkerContext};

fn ignore_signal(sig: libc::c_int) {
    unsafe {
        libc::signal(sig, libc::SIG_IGN);
    }
}

fn daemonize() -> Result<()> {
    // Keep the working directory and stdio
    if unsafe { libc::daemon(1, 1) } < 0 {
        return Err(std::io::Error::last_os_error()).context("daemon(1, 1)");
    }
    for sig in [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT] {
        ignore_signal(sig);
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = GatewayOpts::parse();
    let settings = opts.into_config()?.validate().context("invalid configuration")?;

    // Fork before any thread exists
    if settings.daemonize {
        daemonize()?;
    }
    sgw::logger::init(settings.log_file.as_deref())?;
    ignore_signal(libc::SIGPIPE);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        local = %settings.local.socket_addr(),
        local_id = format_args!("{:#x}", settings.local.id),
        connect = %settings.connect,
        asm = %settings.asm.socket_addr(),
        workers = settings.workers,
        backends = ?settings.backends,
        "sgwd starting"
    );
    for root in &settings.backends {
        if !root.is_dir() {
            bail!("backend directory {} does not exist", root.display());
        }
    }

    let launcher = Box::new(ScriptLauncher::new(settings.migration.clone()));
    let workers = settings.workers;
    let listen_addr = settings.local.socket_addr();
    let gateway = Gateway::new(settings, launcher);

    if !gateway.settings.daemonize {
        let gw = Arc::clone(&gateway);
        ctrlc::set_handler(move || {
            info!("interrupted, shutting down");
            gw.request_shutdown();
        })
        .context("install Ctrl-C handler")?;
    }

    let mut readers = Vec::with_capacity(workers);
    let mut writers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let pipe = HandoffPipe::new()?;
        readers.push(pipe.reader);
        writers.push(pipe.writer);
    }

    let socket = net::bind_listener(listen_addr)
        .with_context(|| format!("listen on {}", listen_addr))?;
    let ctx = WorkerContext::new(0, Arc::clone(&gateway))?.with_listener(socket, writers)?;
    let mut listener = Worker::new(ctx)?;

    let handles = worker::spawn_workers(&gateway, readers)?;
    heartbeat::arm(&mut listener)?;

    if let Err(e) = listener.run() {
        worker::fatal(format!("listener reactor failed: {:#}", e));
    }
    for h in handles {
        if h.join().is_err() {
            error!("worker thread panicked");
        }
    }
    info!("sgwd stopped");
    Ok(())
}
