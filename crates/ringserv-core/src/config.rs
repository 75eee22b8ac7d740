//! Server and worker configuration.
//!
//! Plain structs with `Default` impls; the binary fills them from argv and
//! environment. A `WorkerConfig` is derived per worker at spawn time and is
//! the only thing a worker sees.

use std::time::Duration;

/// The fixed response written on every successful read. The request bytes
/// are never inspected.
pub const DEFAULT_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: keep-alive\r\n\
\r\n\
OK";

/// Whole-server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port every worker binds (SO_REUSEPORT).
    pub port: u16,
    /// Number of workers. Defaults to one per online CPU.
    pub workers: usize,
    /// SQ/CQ depth per worker ring. Must be a power of 2.
    pub ring_entries: u32,
    /// Per-connection read buffer size in bytes.
    pub buffer_size: usize,
    /// Connection slots per worker. Defaults to 2x ring depth.
    pub pool_capacity: usize,
    /// listen(2) backlog.
    pub backlog: i32,
    /// Close connections idle for this long. `None` holds them forever.
    pub idle_timeout: Option<Duration>,
    /// Bytes written on each successful read.
    pub response: Vec<u8>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ring_entries = 4096;
        Self {
            port: 8080,
            workers: online_cpus(),
            ring_entries,
            buffer_size: 4096,
            pool_capacity: ring_entries as usize * 2,
            backlog: 65535,
            idle_timeout: None,
            response: DEFAULT_RESPONSE.to_vec(),
        }
    }
}

impl ServerConfig {
    /// Per-worker view, pinned to `cpu_id`.
    pub fn worker(&self, cpu_id: usize) -> WorkerConfig {
        WorkerConfig {
            cpu_id,
            port: self.port,
            ring_entries: self.ring_entries,
            buffer_size: self.buffer_size,
            pool_capacity: self.pool_capacity,
            backlog: self.backlog,
            idle_timeout: self.idle_timeout,
            response: self.response.clone().into_boxed_slice(),
        }
    }
}

/// Everything one worker needs; owned by the worker's thread.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cpu_id: usize,
    pub port: u16,
    pub ring_entries: u32,
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub backlog: i32,
    pub idle_timeout: Option<Duration>,
    pub response: Box<[u8]>,
}

/// Number of online CPUs, at least 1.
pub fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.pool_capacity, cfg.ring_entries as usize * 2);
        assert!(cfg.idle_timeout.is_none());
        assert!(cfg.response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(cfg.response.ends_with(b"\r\n\r\nOK"));
    }

    #[test]
    fn test_worker_view() {
        let cfg = ServerConfig {
            port: 9000,
            ..Default::default()
        };
        let w = cfg.worker(3);
        assert_eq!(w.cpu_id, 3);
        assert_eq!(w.port, 9000);
        assert_eq!(&w.response[..], &cfg.response[..]);
    }
}
