use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::{anyhow, bail, Context};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::MessengerConfig;
use crate::messenger::Messenger;

/// Owns the listening socket and produces accepting-state pipes. One poll
///  task; `stop` half-shuts the listener to unblock it and joins it, and is
///  safe to call repeatedly.
pub struct Acceptor {
    msgr: Weak<Messenger>,
    config: Arc<MessengerConfig>,
    done: AtomicBool,
    stop_cond: Notify,
    inner: StdMutex<AcceptorInner>,
}

struct AcceptorInner {
    listener: Option<Arc<TcpListener>>,
    task: Option<JoinHandle<()>>,
}

impl Acceptor {
    pub(crate) fn new(msgr: Weak<Messenger>, config: Arc<MessengerConfig>) -> Acceptor {
        Acceptor {
            msgr,
            config,
            done: AtomicBool::new(false),
            stop_cond: Notify::new(),
            inner: StdMutex::new(AcceptorInner {
                listener: None,
                task: None,
            }),
        }
    }

    /// Bind the listening socket. A concrete port is bound directly (with
    ///  SO_REUSEADDR); port 0 scans the configured range, skipping the avoid
    ///  ports. Publishes the bound address (with the messenger nonce) as the
    ///  messenger identity.
    pub(crate) async fn bind(
        &self,
        addr: Option<SocketAddr>,
        avoid_port1: u16,
        avoid_port2: u16,
    ) -> anyhow::Result<()> {
        debug!("accepter.bind");
        let addr = addr.unwrap_or_else(|| {
            if self.config.bind_ipv6 {
                "[::]:0".parse().expect("literal address")
            } else {
                "0.0.0.0:0".parse().expect("literal address")
            }
        });

        let make_socket = || -> anyhow::Result<TcpSocket> {
            let socket = if addr.is_ipv6() {
                TcpSocket::new_v6()
            } else {
                TcpSocket::new_v4()
            }
            .context("unable to create socket")?;
            if self.config.tcp_rcvbuf > 0 {
                socket
                    .set_recv_buffer_size(self.config.tcp_rcvbuf)
                    .context("unable to set SO_RCVBUF")?;
            }
            Ok(socket)
        };

        let listener = if addr.port() != 0 {
            // a specific port was requested; reuse addr+port when possible
            let socket = make_socket()?;
            socket.set_reuseaddr(true).context("unable to setsockopt")?;
            socket
                .bind(addr)
                .with_context(|| format!("unable to bind to {}", addr))?;
            socket.listen(128).context("unable to listen")?
        } else {
            // scan the configured range
            let mut bound = None;
            for port in self.config.bind_port_min..=self.config.bind_port_max {
                if port == avoid_port1 || port == avoid_port2 {
                    continue;
                }
                let socket = make_socket()?;
                let try_addr = SocketAddr::new(addr.ip(), port);
                match socket.bind(try_addr) {
                    Ok(()) => {
                        bound = Some(socket.listen(128).context("unable to listen")?);
                        break;
                    }
                    Err(e) => trace!("port {} not usable: {}", port, e),
                }
            }
            match bound {
                Some(listener) => {
                    debug!("accepter.bind bound on random port");
                    listener
                }
                None => bail!(
                    "unable to bind to {} on any port in range {}-{}",
                    addr.ip(),
                    self.config.bind_port_min,
                    self.config.bind_port_max
                ),
            }
        };

        let local = listener.local_addr().context("failed getsockname")?;
        debug!("accepter.bind bound to {}", local);

        let msgr = self
            .msgr
            .upgrade()
            .ok_or_else(|| anyhow!("messenger is gone"))?;
        msgr.set_bound_addr(local);

        self.inner.lock().unwrap().listener = Some(Arc::new(listener));
        Ok(())
    }

    pub(crate) fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        debug!("accepter.start");
        let mut inner = self.inner.lock().unwrap();
        let listener = inner
            .listener
            .clone()
            .ok_or_else(|| anyhow!("accepter is not bound"))?;
        if inner.task.is_some() {
            return Ok(());
        }
        self.done.store(false, Ordering::Release);
        inner.task = Some(tokio::spawn(accept_loop(self.clone(), listener)));
        Ok(())
    }

    /// Unblock and join the poll task, then close the listening socket.
    pub(crate) async fn stop(&self) {
        debug!("stop accepter");
        self.done.store(true, Ordering::Release);
        self.stop_cond.notify_waiters();

        let (listener, task) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.listener.take(), inner.task.take())
        };

        // half-shut so nothing can sit in accept against a closing socket
        if let Some(listener) = &listener {
            let _ = nix::sys::socket::shutdown(
                listener.as_raw_fd(),
                nix::sys::socket::Shutdown::Both,
            );
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        drop(listener);
        self.done.store(false, Ordering::Release);
    }

    /// Stop, forget the learned address, and bind again on a fresh port with
    ///  the old one avoided.
    pub(crate) async fn rebind(self: &Arc<Self>, avoid_port: u16) -> anyhow::Result<()> {
        debug!("accepter.rebind avoid {}", avoid_port);
        self.stop().await;

        let msgr = self
            .msgr
            .upgrade()
            .ok_or_else(|| anyhow!("messenger is gone"))?;
        msgr.unlearn_addr();

        let old = msgr.my_addr();
        let mut fresh = old.addr;
        fresh.set_port(0);
        debug!("accepter.rebind will try {}", fresh);

        self.bind(Some(fresh), old.port(), avoid_port).await?;
        self.start()
    }
}

async fn accept_loop(acceptor: Arc<Acceptor>, listener: Arc<TcpListener>) {
    debug!("accepter starting");
    let mut errors = 0;

    while !acceptor.done.load(Ordering::Acquire) {
        let stopped = acceptor.stop_cond.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        tokio::select! {
            _ = stopped => break,
            result = listener.accept() => match result {
                Ok((stream, from)) => {
                    errors = 0;
                    debug!("accepted incoming on {}", from);
                    let Some(msgr) = acceptor.msgr.upgrade() else {
                        break;
                    };
                    msgr.add_accept_pipe(stream).await;
                }
                Err(e) => {
                    warn!("accepter no incoming connection? {}", e);
                    errors += 1;
                    if errors > 4 {
                        break;
                    }
                }
            }
        }
    }
    debug!("accepter stopping");
}
