//! End-to-end tests: real sockets, both server backends, one process.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use crate::client;
use crate::error::Error;
use crate::server::{listen, serve, Listener, PoolConfig, ServeConfig};
use crate::wire;
use crate::wire::{PROTOCOL_VERSION, TRANSFER_ACK};

fn scratch_root(files: &[(&str, &[u8])]) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let root = dir.path().join("served");
    fs::create_dir(&root).unwrap();
    for (name, content) in files {
        fs::write(root.join(name), content).unwrap();
    }
    (dir, root)
}

enum Backend {
    Multiplexed { max_clients: usize, idle_timeout: u64 },
    Pooled,
}

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(root: PathBuf, backend: Backend) -> Self {
        let listener = Listener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Some(Arc::clone(&stop));

        let handle = thread::spawn(move || match backend {
            Backend::Multiplexed {
                max_clients,
                idle_timeout,
            } => {
                let config = ServeConfig {
                    max_clients,
                    idle_timeout,
                    stop_serving: stop_flag,
                };
                serve(listener, root, &config).unwrap();
            }
            Backend::Pooled => {
                let config = PoolConfig {
                    stop_serving: stop_flag,
                    ..Default::default()
                };
                listen(listener, root, &config).unwrap();
            }
        });

        TestServer {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    fn download(&self, filename: &str, max: u64, dest: &std::path::Path) -> crate::Result<u64> {
        let mut stream = client::connect("127.0.0.1", self.addr.port())?;
        client::download(&mut *stream, filename, max, dest)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // wake the serve loop so it observes the flag
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_round_trip_multiplexed() {
    let content = patterned(200_000);
    let (_dir, root) = scratch_root(&[("payload.bin", &content)]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 4,
            idle_timeout: 0,
        },
    );

    let out = tempdir().unwrap();
    let dest = out.path().join("payload.bin");
    let n = server.download("payload.bin", 1 << 20, &dest).unwrap();

    assert_eq!(n, content.len() as u64);
    assert_eq!(fs::read(&dest).unwrap(), content);
}

#[test]
fn test_round_trip_pooled() {
    let content = patterned(64_123);
    let (_dir, root) = scratch_root(&[("payload.bin", &content)]);
    let server = TestServer::start(root, Backend::Pooled);

    let out = tempdir().unwrap();
    let dest = out.path().join("payload.bin");
    let n = server.download("payload.bin", 1 << 20, &dest).unwrap();

    assert_eq!(n, content.len() as u64);
    assert_eq!(fs::read(&dest).unwrap(), content);
}

#[test]
fn test_pooled_serves_clients_in_parallel() {
    let content = patterned(30_000);
    let (_dir, root) = scratch_root(&[("payload.bin", &content)]);
    let server = Arc::new(TestServer::start(root, Backend::Pooled));

    let mut joins = Vec::new();
    for i in 0..4 {
        let server = Arc::clone(&server);
        let expected = content.clone();
        joins.push(thread::spawn(move || {
            let out = tempdir().unwrap();
            let dest = out.path().join(format!("copy-{}", i));
            server.download("payload.bin", 1 << 20, &dest).unwrap();
            assert_eq!(fs::read(&dest).unwrap(), expected);
        }));
    }
    for join in joins {
        join.join().unwrap();
    }
}

#[test]
fn test_missing_file_is_rejected_before_size() {
    let (_dir, root) = scratch_root(&[]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 0,
        },
    );

    let out = tempdir().unwrap();
    let dest = out.path().join("never");
    let err = server.download("absent.txt", 1 << 20, &dest).unwrap_err();

    assert!(matches!(err, Error::FileUnavailable));
    assert!(!dest.exists());
}

#[test]
fn test_traversal_request_is_rejected() {
    let (dir, root) = scratch_root(&[]);
    fs::write(dir.path().join("secret.txt"), b"keep out").unwrap();
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 0,
        },
    );

    let out = tempdir().unwrap();
    let dest = out.path().join("stolen");
    let err = server.download("../secret.txt", 1 << 20, &dest).unwrap_err();

    assert!(matches!(err, Error::FileUnavailable));
    assert!(!dest.exists());
}

#[test]
fn test_oversized_file_is_declined() {
    let content = patterned(10_000);
    let (_dir, root) = scratch_root(&[("big.bin", &content)]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 0,
        },
    );

    let out = tempdir().unwrap();
    let dest = out.path().join("big.bin");
    let err = server.download("big.bin", 100, &dest).unwrap_err();

    assert!(matches!(
        err,
        Error::FileTooLarge {
            size: 10_000,
            limit: 100
        }
    ));
    assert!(!dest.exists());
}

#[test]
fn test_version_mismatch_closes_before_filename() {
    let (_dir, root) = scratch_root(&[]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 0,
        },
    );

    let mut raw = TcpStream::connect(server.addr).unwrap();
    raw.write_all(&[PROTOCOL_VERSION + 1]).unwrap();

    let mut verdict = [1u8; 1];
    raw.read_exact(&mut verdict).unwrap();
    assert_eq!(verdict[0], 0);

    // nothing else follows; the server hangs up
    let mut rest = Vec::new();
    raw.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_concurrency_bound_holds() {
    let content = patterned(5_000);
    let (_dir, root) = scratch_root(&[("payload.bin", &content)]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 1,
            idle_timeout: 0,
        },
    );

    // occupy the only slot with a connection that never speaks
    let hog = TcpStream::connect(server.addr).unwrap();
    thread::sleep(Duration::from_millis(100));

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let addr = server.addr;
    let expected = content.clone();
    let second = thread::spawn(move || {
        let out = tempdir().unwrap();
        let dest = out.path().join("copy");
        let mut stream = client::connect("127.0.0.1", addr.port()).unwrap();
        let n = client::download(&mut *stream, "payload.bin", 1 << 20, &dest).unwrap();
        done_flag.store(true, Ordering::SeqCst);
        assert_eq!(n, expected.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), expected);
    });

    // with the slot held, the second client cannot make progress
    thread::sleep(Duration::from_millis(300));
    assert!(!done.load(Ordering::SeqCst));

    drop(hog);
    second.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_byte_at_a_time_peer_gets_exact_content() {
    let content = patterned(600);
    let (_dir, root) = scratch_root(&[("small.bin", &content)]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 0,
        },
    );

    let mut raw = TcpStream::connect(server.addr).unwrap();
    raw.set_nodelay(true).unwrap();

    raw.write_all(&[PROTOCOL_VERSION]).unwrap();
    let mut flag = [0u8; 1];
    raw.read_exact(&mut flag).unwrap();
    assert_eq!(flag[0], 1);

    // dribble the filename buffer one byte per write
    let namebuf = wire::encode_filename("small.bin").unwrap();
    for b in namebuf.iter() {
        raw.write_all(&[*b]).unwrap();
    }

    raw.read_exact(&mut flag).unwrap();
    assert_eq!(flag[0], 1);

    let mut size = [0u8; 8];
    for i in 0..size.len() {
        raw.read_exact(&mut size[i..=i]).unwrap();
    }
    assert_eq!(u64::from_be_bytes(size), content.len() as u64);

    raw.write_all(&[1]).unwrap();

    let mut received = Vec::with_capacity(content.len());
    let mut byte = [0u8; 1];
    for _ in 0..content.len() {
        raw.read_exact(&mut byte).unwrap();
        received.push(byte[0]);
    }
    assert_eq!(received, content);

    raw.write_all(&[TRANSFER_ACK]).unwrap();
}

#[test]
fn test_slots_are_reusable_across_sessions() {
    let content = patterned(2_000);
    let (_dir, root) = scratch_root(&[("payload.bin", &content)]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 1,
            idle_timeout: 0,
        },
    );

    let out = tempdir().unwrap();
    for i in 0..3 {
        let dest = out.path().join(format!("copy-{}", i));
        let n = server.download("payload.bin", 1 << 20, &dest).unwrap();
        assert_eq!(n, content.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), content);
    }
}

#[test]
fn test_idle_sessions_are_swept() {
    let (_dir, root) = scratch_root(&[]);
    let server = TestServer::start(
        root,
        Backend::Multiplexed {
            max_clients: 2,
            idle_timeout: 1,
        },
    );

    let mut raw = TcpStream::connect(server.addr).unwrap();
    // never send the version byte; the sweep should hang up on us
    let mut buf = [0u8; 1];
    raw.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let n = raw.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}
