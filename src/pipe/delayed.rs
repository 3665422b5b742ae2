use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dispatch::DispatchSink;
use crate::message::Message;

/// Fault-injection aid: holds received messages until a wall-clock release
///  time before forwarding them to the dispatch queue, simulating a slow or
///  reordering-prone peer without touching the protocol code.
pub(crate) struct DelayedDelivery {
    queue: Mutex<VecDeque<(Instant, Message)>>,
    cond: Notify,
    stopping: AtomicBool,
    dispatch: Arc<dyn DispatchSink>,
    conn_id: u64,
}

impl DelayedDelivery {
    pub fn spawn(dispatch: Arc<dyn DispatchSink>, conn_id: u64) -> Arc<DelayedDelivery> {
        let this = Arc::new(DelayedDelivery {
            queue: Mutex::new(VecDeque::new()),
            cond: Notify::new(),
            stopping: AtomicBool::new(false),
            dispatch,
            conn_id,
        });
        tokio::spawn(run(this.clone()));
        this
    }

    pub async fn queue(&self, release: Instant, msg: Message) {
        self.queue.lock().await.push_back((release, msg));
        self.cond.notify_waiters();
    }

    /// Hand everything to the dispatch queue immediately, in order.
    pub async fn flush(&self) {
        debug!("delayed delivery flush");
        let mut queue = self.queue.lock().await;
        while let Some((_, msg)) = queue.pop_front() {
            let priority = msg.priority;
            self.dispatch.enqueue(msg, priority, self.conn_id).await;
        }
    }

    /// Drop everything held back (throttle reservations are released by the
    ///  messages' drop).
    pub async fn discard(&self) {
        debug!("delayed delivery discard");
        self.queue.lock().await.clear();
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cond.notify_waiters();
    }
}

async fn run(this: Arc<DelayedDelivery>) {
    debug!("delayed delivery starting");
    loop {
        if this.stopping.load(Ordering::Acquire) {
            break;
        }

        let mut queue = this.queue.lock().await;
        match queue.front() {
            None => {
                let notified = this.cond.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(queue);
                notified.await;
            }
            Some((release, _)) if *release > Instant::now() => {
                let release = *release;
                let notified = this.cond.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                drop(queue);
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(release) => {}
                }
            }
            Some(_) => {
                let (_, msg) = queue.pop_front().expect("front just observed");
                trace!("delayed delivery releasing {:?}", msg);
                let priority = msg.priority;
                this.dispatch.enqueue(msg, priority, this.conn_id).await;
            }
        }
    }
    debug!("delayed delivery stopping");
}
