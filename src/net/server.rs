use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::{Config, ConfigVar};
use crate::reactor::IoHandle;
use crate::scheduler::Task;

use super::Socket;

pub const DEFAULT_READ_TIMEOUT_MS: u64 = 2 * 60 * 1000;

const DEFAULT_NAME: &str = concat!("coroio/", env!("CARGO_PKG_VERSION"));

fn read_timeout_var() -> Option<&'static Arc<ConfigVar<u64>>> {
    static VAR: OnceLock<Option<Arc<ConfigVar<u64>>>> = OnceLock::new();
    VAR.get_or_init(|| {
        Config::lookup(
            "tcp_server.read_timeout",
            DEFAULT_READ_TIMEOUT_MS,
            "tcp server read timeout",
        )
        .ok()
    })
    .as_ref()
}

pub(crate) fn register_config() {
    let _ = read_timeout_var();
}

/// Serves one accepted connection. Runs inside a coroutine of the server's
/// worker, so blocking socket calls suspend instead of blocking the thread.
pub trait ClientHandler: Send + Sync + 'static {
    fn handle_client(&self, client: Socket);
}

impl<F> ClientHandler for F
where
    F: Fn(Socket) + Send + Sync + 'static,
{
    fn handle_client(&self, client: Socket) {
        self(client)
    }
}

struct ServerInner {
    name: Mutex<String>,
    worker: IoHandle,
    accept_worker: IoHandle,
    listeners: Mutex<Vec<Arc<Socket>>>,
    read_timeout: AtomicU64,
    stopped: AtomicBool,
    handler: Arc<dyn ClientHandler>,
}

/// Accepts connections on the accept worker and hands each client to the
/// handler on the worker.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new<H>(worker: IoHandle, accept_worker: IoHandle, handler: H) -> TcpServer
    where
        H: ClientHandler,
    {
        let read_timeout = read_timeout_var().map_or(DEFAULT_READ_TIMEOUT_MS, |var| var.value());
        TcpServer {
            inner: Arc::new(ServerInner {
                name: Mutex::new(DEFAULT_NAME.to_string()),
                worker,
                accept_worker,
                listeners: Mutex::new(Vec::new()),
                read_timeout: AtomicU64::new(read_timeout),
                stopped: AtomicBool::new(true),
                handler: Arc::new(handler),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock() = name.to_string();
    }

    /// Receive timeout applied to accepted clients, in milliseconds.
    pub fn read_timeout(&self) -> u64 {
        self.inner.read_timeout.load(Ordering::Relaxed)
    }

    pub fn set_read_timeout(&self, ms: u64) {
        self.inner.read_timeout.store(ms, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.bind_all(&[addr]).map_err(|mut fails| match fails.pop() {
            Some((_, e)) => e,
            None => io::Error::other("bind failed"),
        })
    }

    /// Bind and listen on every address. If any of them fails, nothing stays
    /// bound and the failures are returned.
    pub fn bind_all(&self, addrs: &[SocketAddr]) -> Result<(), Vec<(SocketAddr, io::Error)>> {
        let mut bound = Vec::with_capacity(addrs.len());
        let mut fails = Vec::new();
        for addr in addrs {
            let result = Socket::tcp(addr).and_then(|sock| {
                sock.bind(addr)?;
                sock.listen(libc::SOMAXCONN)?;
                Ok(sock)
            });
            match result {
                Ok(sock) => bound.push(Arc::new(sock)),
                Err(e) => {
                    tracing::error!("TcpServer bind {} failed: {}", addr, e);
                    fails.push((*addr, e));
                }
            }
        }
        if !fails.is_empty() {
            self.inner.listeners.lock().clear();
            return Err(fails);
        }

        for sock in &bound {
            tracing::info!(
                "TcpServer {} bind success: {:?}",
                self.name(),
                sock.local_addr().ok()
            );
        }
        self.inner.listeners.lock().extend(bound);
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .listeners
            .lock()
            .iter()
            .filter_map(|sock| sock.local_addr().ok())
            .collect()
    }

    /// Start one accept loop per listener. `false` if already running.
    pub fn start(&self) -> bool {
        if self
            .inner
            .stopped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let listeners = self.inner.listeners.lock().clone();
        for sock in listeners {
            let inner = self.inner.clone();
            self.inner
                .accept_worker
                .schedule(Task::callback(move || inner.accept_loop(sock)));
        }
        true
    }

    /// Cancel pending accepts and close the listeners on the accept worker.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let inner = self.inner.clone();
        self.inner.accept_worker.schedule(Task::callback(move || {
            let listeners: Vec<_> = inner.listeners.lock().drain(..).collect();
            for sock in listeners {
                sock.cancel_all();
                if let Err(e) = sock.close() {
                    tracing::warn!("TcpServer close listener failed: {}", e);
                }
            }
        }));
    }
}

impl ServerInner {
    fn accept_loop(self: Arc<Self>, sock: Arc<Socket>) {
        while !self.stopped.load(Ordering::Acquire) {
            match sock.accept() {
                Ok(client) => {
                    if let Err(e) = client.set_recv_timeout(self.read_timeout.load(Ordering::Relaxed)) {
                        tracing::warn!("set_recv_timeout on fd {} failed: {}", client.fd(), e);
                    }
                    let handler = self.handler.clone();
                    self.worker
                        .schedule(Task::callback(move || handler.handle_client(client)));
                }
                Err(e) => {
                    if self.stopped.load(Ordering::Acquire) || !sock.is_valid() {
                        break;
                    }
                    tracing::error!("accept on fd {} failed: {}", sock.fd(), e);
                }
            }
        }
        tracing::debug!("accept loop on fd {} exits", sock.fd());
    }
}
