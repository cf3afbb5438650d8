//! Blocking URL probe used by delay tests

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use url::Url;

use super::stats::Statistics;
use crate::engine::{EngineError, SocketHook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

/// Where a delay test connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let url = Url::parse(raw).map_err(|e| EngineError::Probe(format!("{raw}: {e}")))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(EngineError::Probe(format!("unsupported scheme {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Probe(format!("{raw}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| EngineError::Probe(format!("{raw}: missing port")))?;
        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    fn resolve(&self) -> Result<SocketAddr, EngineError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Probe(format!("resolve {}: {e}", self.host)))?
            .next()
            .ok_or_else(|| EngineError::Probe(format!("resolve {}: no addresses", self.host)))
    }
}

/// Measure one round trip to `target`, in milliseconds
///
/// Plain HTTP targets get a `HEAD` request and the time until the status
/// line arrives. HTTPS targets are timed up to the completed TCP handshake.
pub fn run(
    target: &Target,
    hook: Option<SocketHook>,
    timeout: Duration,
    stats: &Statistics,
    chain: &str,
) -> Result<u32, EngineError> {
    let addr = target.resolve()?;
    let started = Instant::now();

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(hook) = hook {
        protect(&hook, &socket).map_err(|e| EngineError::Probe(format!("protect: {e}")))?;
    }
    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|e| EngineError::Probe(format!("connect {addr}: {e}")))?;
    let stream: TcpStream = socket.into();

    if target.scheme == Scheme::Https {
        return Ok(millis(started.elapsed()));
    }

    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let id = stats.track(&target.host, target.port, chain, stream.try_clone()?);
    let exchanged = exchange(&stream, target, stats, &id);
    stats.untrack(&id);
    exchanged.map_err(|e| EngineError::Probe(e.to_string()))?;

    Ok(millis(started.elapsed()))
}

fn exchange(stream: &TcpStream, target: &Target, stats: &Statistics, id: &str) -> io::Result<u16> {
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: conduit/{}\r\nConnection: close\r\n\r\n",
        target.path,
        target.host,
        env!("CARGO_PKG_VERSION"),
    );
    let mut writer = stream;
    writer.write_all(request.as_bytes())?;
    stats.record(id, request.len() as u64, 0);

    let mut status_line = String::new();
    let read = BufReader::new(stream).read_line(&mut status_line)?;
    stats.record(id, 0, read as u64);

    status_line
        .strip_prefix("HTTP/")
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed status line: {:?}", status_line.trim_end()),
            )
        })
}

#[cfg(unix)]
fn protect(hook: &SocketHook, socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    hook(socket.as_raw_fd())
}

#[cfg(not(unix))]
fn protect(_hook: &SocketHook, _socket: &Socket) -> io::Result<()> {
    Ok(())
}

fn millis(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX).max(1)
}
