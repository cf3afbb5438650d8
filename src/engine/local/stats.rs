//! Traffic counters and the connection table

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::engine::Traffic;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub network: &'static str,
    pub host: String,
    pub destination_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub metadata: Metadata,
    pub upload: u64,
    pub download: u64,
    pub start: String,
    pub chains: Vec<String>,
    pub rule: String,
}

struct Tracked {
    info: ConnectionInfo,
    stream: TcpStream,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    download_total: u64,
    upload_total: u64,
    connections: Vec<&'a ConnectionInfo>,
    memory: u64,
}

struct Sample {
    at: Instant,
    up: u64,
    down: u64,
}

pub struct Statistics {
    upload_total: AtomicU64,
    download_total: AtomicU64,
    sample: Mutex<Sample>,
    connections: Mutex<HashMap<String, Tracked>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            sample: Mutex::new(Sample {
                at: Instant::now(),
                up: 0,
                down: 0,
            }),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> Traffic {
        Traffic {
            up: self.upload_total.load(Ordering::Relaxed),
            down: self.download_total.load(Ordering::Relaxed),
        }
    }

    /// Bytes per second since the previous call
    pub fn rate(&self) -> Traffic {
        let total = self.total();
        let mut sample = self.sample.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now
            .duration_since(sample.at)
            .max(Duration::from_secs(1))
            .as_secs_f64();
        let rate = Traffic {
            up: (total.up.saturating_sub(sample.up) as f64 / elapsed) as u64,
            down: (total.down.saturating_sub(sample.down) as f64 / elapsed) as u64,
        };
        *sample = Sample {
            at: now,
            up: total.up,
            down: total.down,
        };
        rate
    }

    pub fn reset(&self) {
        self.upload_total.store(0, Ordering::Relaxed);
        self.download_total.store(0, Ordering::Relaxed);
        let mut sample = self.sample.lock().unwrap_or_else(PoisonError::into_inner);
        *sample = Sample {
            at: Instant::now(),
            up: 0,
            down: 0,
        };
    }

    /// Track an open connection; `stream` is kept to close it on request
    pub fn track(&self, host: &str, port: u16, chain: &str, stream: TcpStream) -> String {
        let id = format!("{:032x}", rand::random::<u128>());
        let start = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let info = ConnectionInfo {
            id: id.clone(),
            metadata: Metadata {
                network: "tcp",
                host: host.to_string(),
                destination_port: port,
            },
            upload: 0,
            download: 0,
            start,
            chains: vec![chain.to_string()],
            rule: "Match".to_string(),
        };
        self.connections().insert(id.clone(), Tracked { info, stream });
        id
    }

    pub fn record(&self, id: &str, up: u64, down: u64) {
        self.upload_total.fetch_add(up, Ordering::Relaxed);
        self.download_total.fetch_add(down, Ordering::Relaxed);
        if let Some(tracked) = self.connections().get_mut(id) {
            tracked.info.upload += up;
            tracked.info.download += down;
        }
    }

    pub fn untrack(&self, id: &str) {
        self.connections().remove(id);
    }

    pub fn close(&self, id: &str) -> bool {
        match self.connections().remove(id) {
            Some(tracked) => {
                let _ = tracked.stream.shutdown(Shutdown::Both);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<Tracked> = self.connections().drain().map(|(_, t)| t).collect();
        for tracked in drained {
            let _ = tracked.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn snapshot(&self, memory: u64) -> serde_json::Value {
        let total = self.total();
        let connections = self.connections();
        let mut list: Vec<&ConnectionInfo> = connections.values().map(|t| &t.info).collect();
        list.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        serde_json::to_value(Snapshot {
            download_total: total.down,
            upload_total: total.up,
            connections: list,
            memory,
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Resident memory of this process in bytes
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn resident_memory() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * u64::try_from(page_size).unwrap_or(4096)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn resident_memory() -> u64 {
    0
}

/// Hand freed heap pages back to the operating system
pub fn trim_heap() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator metadata
        unsafe {
            libc::malloc_trim(0);
        }
    }
}
