//!Client and server support for the filelink file-transfer protocol.
//!
//!filelink is a small TCP protocol for fetching single files from a served
//!directory: a version handshake, a fixed-size filename request, a
//!size/readiness negotiation, then the raw file bytes and a final
//!acknowledgement. See the [`wire`] module for the exact layout.
//!
//!The server side is built around a per-connection state machine
//!([`Session`]) that performs at most one protocol step per readiness
//!event. Two backends schedule it:
//!
//!- [`serve`] multiplexes all sessions on a single thread over `select`,
//!  bounded by a fixed session table.
//!- [`listen`] runs one blocking session per pooled worker thread.
//!
//!A typical server:
//!
//!```no_run
//!let listener = filelink::Listener::bind("127.0.0.1:4433")?;
//!let config = filelink::ServeConfig {
//!    max_clients: 32,
//!    ..Default::default()
//!};
//!filelink::serve(listener, "/srv/files", &config)?;
//!# Ok::<(), filelink::Error>(())
//!```
//!
//!And the matching client:
//!
//!```no_run
//!use std::path::Path;
//!
//!let mut stream = filelink::client::connect("127.0.0.1", 4433)?;
//!let n = filelink::client::download(&mut *stream, "notes.txt", 1 << 20, Path::new("notes.txt"))?;
//!println!("received {} bytes", n);
//!# Ok::<(), filelink::Error>(())
//!```

pub mod client;
mod error;
pub mod machine;
mod paths;
mod poll;
mod server;
mod stream;
pub mod wire;

#[cfg(test)]
mod test;

pub use crate::error::{Error, Result};
pub use crate::machine::{Direction, Readiness, Session, SessionState};
pub use crate::poll::{FdSet, Interests, Wait};
pub use crate::server::{listen, serve, Listener, PoolConfig, ServeConfig};
pub use crate::stream::Stream;
pub use crate::wire::{CHUNK_CEILING, FILENAME_WIRE_LEN, PROTOCOL_VERSION, TRANSFER_ACK};
