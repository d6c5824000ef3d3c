use std::path::Path;
use std::process;

use clap::{Arg, Command};
use tracing::error;

use filelink::client;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("filelink-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Fetch a file from a filelink server")
        .arg(
            Arg::new("address")
                .required(true)
                .help("Server address, e.g. 127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("Server port"),
        )
        .arg(
            Arg::new("filename")
                .required(true)
                .help("Name of the file to fetch"),
        )
        .arg(
            Arg::new("max-file-size")
                .required(true)
                .value_parser(clap::value_parser!(u64))
                .help("Largest acceptable file size in bytes"),
        )
        .get_matches();

    let address = matches.get_one::<String>("address").unwrap();
    let port = *matches.get_one::<u16>("port").unwrap();
    let filename = matches.get_one::<String>("filename").unwrap();
    let max_file_size = *matches.get_one::<u64>("max-file-size").unwrap();

    // the copy lands under the requested name in the working directory
    let dest = Path::new(filename)
        .file_name()
        .map(Path::new)
        .unwrap_or_else(|| Path::new(filename))
        .to_path_buf();

    let mut stream = match client::connect(address, port) {
        Ok(stream) => stream,
        Err(e) => {
            error!(address = %address, port, error = %e, "connection failed");
            process::exit(1);
        }
    };

    match client::download(&mut *stream, filename, max_file_size, &dest) {
        Ok(n) => {
            println!("{} ({} bytes) -> {}", filename, n, dest.display());
        }
        Err(e) => {
            error!(filename = %filename, error = %e, "transfer failed");
            process::exit(1);
        }
    }
}
