use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::{Arg, Command};
use tracing::info;

use filelink::{listen, serve, Listener, PoolConfig, ServeConfig};

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(flag) = STOP.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            handle_signal as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            handle_signal as *const () as libc::sighandler_t,
        );
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("filelink-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Serve files from a directory over the filelink protocol")
        .arg(
            Arg::new("address")
                .required(true)
                .help("Address to bind, e.g. 127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("Port to bind"),
        )
        .arg(
            Arg::new("root")
                .required(true)
                .help("Directory to serve files from"),
        )
        .arg(
            Arg::new("max-clients")
                .required(true)
                .value_parser(clap::value_parser!(usize))
                .help("Maximum number of concurrently served clients"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_parser(["multiplexed", "pooled"])
                .default_value("multiplexed")
                .help("Concurrency backend"),
        )
        .arg(
            Arg::new("idle-timeout")
                .long("idle-timeout")
                .value_parser(clap::value_parser!(u64))
                .default_value("0")
                .help("Seconds before an idle session is dropped (0 disables)"),
        )
        .get_matches();

    let address = matches.get_one::<String>("address").unwrap();
    let port = *matches.get_one::<u16>("port").unwrap();
    let root = matches.get_one::<String>("root").unwrap();
    let max_clients = *matches.get_one::<usize>("max-clients").unwrap();
    let backend = matches.get_one::<String>("backend").unwrap();
    let idle_timeout = *matches.get_one::<u64>("idle-timeout").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    STOP.set(Arc::clone(&stop)).expect("stop flag set twice");
    install_signal_handlers();

    let listener = Listener::bind((address.as_str(), port))
        .with_context(|| format!("failed to bind {}:{}", address, port))?;

    info!(address = %address, port, root = %root, max_clients, backend = %backend, "starting");

    match backend.as_str() {
        "pooled" => {
            let config = PoolConfig {
                max_workers: max_clients,
                stop_serving: Some(stop),
                ..Default::default()
            };
            listen(listener, root, &config).context("server failed")?;
        }
        _ => {
            let config = ServeConfig {
                max_clients,
                idle_timeout,
                stop_serving: Some(stop),
            };
            serve(listener, root, &config).context("server failed")?;
        }
    }

    info!("bye");
    Ok(())
}
