//! TCP full-mesh transport: one OS process per rank.
//!
//! Rendezvous:
//! 1. Rank 0 listens on `MASTER_PORT`.
//! 2. Every other rank binds an ephemeral listener, connects to rank 0
//!    (retrying until the connect timeout) and announces `(rank, port)`.
//! 3. Once all ranks have checked in, rank 0 sends each of them the address
//!    table of the whole world.
//! 4. Each rank connects to every lower non-zero rank and accepts a
//!    connection from every higher rank.
//!
//! After rendezvous there is exactly one stream per pair of ranks. Streams
//! are owned by the progress thread and carry length-prefixed frames.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use super::engine::Links;
use super::error::{DistributedError, Result};
use super::launcher::DistributedConfig;
use super::process_group::StaticProcessGroup;
use super::transport::HostTransport;

const RETRY_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Upper bound on a single frame (4 GiB).
const MAX_FRAME_LEN: u64 = 1 << 32;

/// Initial receive buffer; larger frames grow it as bytes arrive.
const FRAME_CHUNK: u64 = 1 << 26;

/// One stream per peer, indexed by rank.
pub struct TcpLinks {
    rank: usize,
    streams: Vec<Option<TcpStream>>,
}

impl TcpLinks {
    fn stream(&mut self, peer: usize) -> Result<&mut TcpStream> {
        let world_size = self.streams.len();
        self.streams
            .get_mut(peer)
            .and_then(Option::as_mut)
            .ok_or(DistributedError::InvalidRank {
                rank: peer,
                world_size,
            })
    }
}

impl Links for TcpLinks {
    fn send_to(&mut self, peer: usize, frame: Vec<u8>) -> Result<()> {
        let rank = self.rank;
        let stream = self.stream(peer)?;
        write_frame(stream, &frame).map_err(|e| peer_error(rank, peer, e))
    }

    fn recv_from(&mut self, peer: usize) -> Result<Vec<u8>> {
        let rank = self.rank;
        let stream = self.stream(peer)?;
        read_frame(stream).map_err(|e| peer_error(rank, peer, e))
    }
}

fn peer_error(rank: usize, peer: usize, e: io::Error) -> DistributedError {
    DistributedError::Transport(format!("rank {rank} <-> rank {peer}: {e}"))
}

fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    if frame.len() as u64 > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_LEN} bytes",
                frame.len()
            ),
        ));
    }
    stream.write_all(&(frame.len() as u64).to_le_bytes())?;
    stream.write_all(frame)?;
    stream.flush()
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = read_u64(stream)?;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit of {MAX_FRAME_LEN} bytes"),
        ));
    }
    let mut buf = Vec::with_capacity(len.min(FRAME_CHUNK) as usize);
    let read = Read::by_ref(stream).take(len).read_to_end(&mut buf)?;
    if read as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated after {read} of {len} bytes"),
        ));
    }
    Ok(buf)
}

fn read_u64(stream: &mut TcpStream) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    stream.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_u16(stream: &mut TcpStream) -> io::Result<u16> {
    let mut bytes = [0u8; 2];
    stream.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

/// Announce ourselves to a peer: our rank and our listener port.
fn write_hello(stream: &mut TcpStream, rank: usize, port: u16) -> io::Result<()> {
    stream.write_all(&(rank as u64).to_le_bytes())?;
    stream.write_all(&port.to_le_bytes())?;
    stream.flush()
}

fn read_hello(stream: &mut TcpStream) -> io::Result<(usize, u16)> {
    let rank = read_u64(stream)? as usize;
    let port = read_u16(stream)?;
    Ok((rank, port))
}

fn write_table(stream: &mut TcpStream, table: &[SocketAddr]) -> io::Result<()> {
    let encoded: Vec<String> = table.iter().map(SocketAddr::to_string).collect();
    write_frame(stream, encoded.join("\n").as_bytes())
}

fn read_table(stream: &mut TcpStream) -> Result<Vec<SocketAddr>> {
    let frame = read_frame(stream)?;
    let text = String::from_utf8(frame).map_err(|_| {
        DistributedError::Initialization("address table is not valid UTF-8".into())
    })?;
    text.lines()
        .map(|line| {
            line.parse().map_err(|_| {
                DistributedError::Initialization(format!("bad address {line:?} in table"))
            })
        })
        .collect()
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)
}

fn timeout_error(timeout: Duration) -> DistributedError {
    DistributedError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// Accept one connection, giving up at `deadline`.
fn accept_until(
    listener: &TcpListener,
    deadline: Instant,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                configure(&stream)?;
                return Ok((stream, peer));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(timeout_error(timeout));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Connect to `addr`, retrying until `deadline`.
fn connect_until(addr: &str, deadline: Instant, timeout: Duration) -> Result<TcpStream> {
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                configure(&stream)?;
                tracing::trace!(addr = %addr, attempt, "Connected");
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(
                    attempt,
                    addr = %addr,
                    error = %e,
                    "Retrying connection"
                );
                attempt += 1;
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                tracing::debug!(addr = %addr, attempt, error = %e, "Giving up on connection");
                return Err(timeout_error(timeout));
            }
        }
    }
}

/// Establish the full mesh described by `config`.
pub fn rendezvous(config: &DistributedConfig, timeout: Duration) -> Result<TcpLinks> {
    let deadline = Instant::now() + timeout;
    let world_size = config.world_size;
    let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();

    tracing::info!(
        rank = config.rank,
        world_size,
        master = %config.master_endpoint(),
        "Starting TCP rendezvous"
    );

    if config.rank == 0 {
        let listener = TcpListener::bind(("0.0.0.0", config.master_port)).map_err(|e| {
            DistributedError::Initialization(format!(
                "failed to bind rendezvous port {}: {e}",
                config.master_port
            ))
        })?;

        let mut table: Vec<Option<SocketAddr>> = vec![None; world_size];
        for _ in 1..world_size {
            let (mut stream, peer) = accept_until(&listener, deadline, timeout)?;
            let (rank, port) = read_hello(&mut stream)?;
            if rank == 0 || rank >= world_size || streams[rank].is_some() {
                return Err(DistributedError::Initialization(format!(
                    "unexpected hello from rank {rank} at {peer}"
                )));
            }
            tracing::debug!(rank, peer = %peer, "Rank checked in");
            table[rank] = Some(SocketAddr::new(peer.ip(), port));
            streams[rank] = Some(stream);
        }

        let local = listener.local_addr()?;
        table[0] = Some(SocketAddr::new(local.ip(), local.port()));
        let table: Vec<SocketAddr> = table.into_iter().flatten().collect();
        for stream in streams.iter_mut().flatten() {
            write_table(stream, &table)?;
        }
    } else {
        let bind_ip: IpAddr = "0.0.0.0".parse().map_err(|_| {
            DistributedError::Initialization("invalid bind address".into())
        })?;
        let listener = TcpListener::bind((bind_ip, 0))?;
        let port = listener.local_addr()?.port();

        let mut master = connect_until(&config.master_endpoint(), deadline, timeout)?;
        write_hello(&mut master, config.rank, port)?;
        let table = read_table(&mut master)?;
        if table.len() != world_size {
            return Err(DistributedError::Initialization(format!(
                "address table has {} entries, expected {world_size}",
                table.len()
            )));
        }
        streams[0] = Some(master);

        for (peer, addr) in table.iter().enumerate().take(config.rank).skip(1) {
            let mut stream = connect_until(&addr.to_string(), deadline, timeout)?;
            write_hello(&mut stream, config.rank, port)?;
            tracing::trace!(peer, "Connected to lower rank");
            streams[peer] = Some(stream);
        }

        for _ in config.rank + 1..world_size {
            let (mut stream, peer_addr) = accept_until(&listener, deadline, timeout)?;
            let (peer, _) = read_hello(&mut stream)?;
            if peer <= config.rank || peer >= world_size || streams[peer].is_some() {
                return Err(DistributedError::Initialization(format!(
                    "unexpected hello from rank {peer} at {peer_addr}"
                )));
            }
            tracing::trace!(peer, "Accepted higher rank");
            streams[peer] = Some(stream);
        }
    }

    tracing::info!(rank = config.rank, world_size, "TCP mesh established");
    Ok(TcpLinks {
        rank: config.rank,
        streams,
    })
}

/// Rendezvous and start a host transport over the resulting mesh.
pub fn connect(config: &DistributedConfig, timeout: Duration) -> Result<HostTransport> {
    let group =
        StaticProcessGroup::with_local_rank(config.rank, config.world_size, config.local_rank)?;
    let links = rendezvous(config, timeout)?;
    HostTransport::new(group, "tcp", links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{ReduceOp, Transport};
    use candle_core::{Device, Tensor};

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(rank: usize, world_size: usize, port: u16) -> DistributedConfig {
        DistributedConfig {
            rank,
            world_size,
            local_rank: rank,
            master_addr: "127.0.0.1".into(),
            master_port: port,
        }
    }

    #[test]
    fn three_rank_mesh_all_reduce() {
        let port = free_port();
        let results: Vec<Vec<f64>> = thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|rank| {
                    s.spawn(move || {
                        let transport =
                            connect(&config(rank, 3, port), Duration::from_secs(10)).unwrap();
                        let x = Tensor::new(&[rank as f64 + 1.0, 10.0], &Device::Cpu).unwrap();
                        let r = transport.all_reduce(&x, ReduceOp::Sum).unwrap();
                        transport.barrier().unwrap();
                        transport.shutdown().unwrap();
                        r.to_vec1::<f64>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec![6.0, 30.0]);
        }
    }

    #[test]
    fn synchronize_over_tcp_keeps_root_vars() {
        use crate::distributed::{synchronize_vars, Communicator, InitOptions, ProcessGroupContext};
        use candle_core::Var;
        use std::sync::Arc;

        let port = free_port();
        let values: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|rank| {
                    s.spawn(move || {
                        let transport =
                            connect(&config(rank, 2, port), Duration::from_secs(10)).unwrap();
                        let ctx = Arc::new(ProcessGroupContext::new());
                        ctx.initialize_with_transport(Arc::new(transport), InitOptions::default())
                            .unwrap();
                        let comm = Communicator::new(ctx.clone());
                        let var =
                            Var::new(&[rank as f32 + 1.0, 5.0 - rank as f32], &Device::Cpu)
                                .unwrap();
                        synchronize_vars(&comm, &[var.clone()], 0).unwrap();
                        ctx.finalize().unwrap();
                        var.to_vec1::<f32>().unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for v in values {
            assert_eq!(v, vec![1.0, 5.0]);
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn oversized_frame_length_is_a_transport_error() {
        let (mut client, server) = socket_pair();
        client.write_all(&u64::MAX.to_le_bytes()).unwrap();
        let mut links = TcpLinks {
            rank: 0,
            streams: vec![None, Some(server)],
        };
        let err = links.recv_from(1).unwrap_err();
        assert!(matches!(err, DistributedError::Transport(_)));
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn truncated_frame_is_a_transport_error() {
        let (mut client, server) = socket_pair();
        client.write_all(&16u64.to_le_bytes()).unwrap();
        client.write_all(&[7u8; 4]).unwrap();
        drop(client);
        let mut links = TcpLinks {
            rank: 0,
            streams: vec![None, Some(server)],
        };
        let err = links.recv_from(1).unwrap_err();
        assert!(matches!(err, DistributedError::Transport(_)));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn frames_round_trip_over_a_socket() {
        let (mut client, server) = socket_pair();
        write_frame(&mut client, b"hello").unwrap();
        let mut links = TcpLinks {
            rank: 0,
            streams: vec![None, Some(server)],
        };
        assert_eq!(links.recv_from(1).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn missing_peer_times_out() {
        let port = free_port();
        let err = rendezvous(&config(0, 2, port), Duration::from_millis(200))
            .err()
            .unwrap();
        assert!(matches!(err, DistributedError::Timeout { timeout_ms: 200 }));
    }

    #[test]
    fn unreachable_master_times_out() {
        let port = free_port();
        let err = rendezvous(&config(1, 2, port), Duration::from_millis(300))
            .err()
            .unwrap();
        assert!(matches!(err, DistributedError::Timeout { .. }));
    }
}
