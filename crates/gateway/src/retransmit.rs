//! Timer-driven reliable downstream delivery.
//!
//! Every delivered downstream message gets a task keyed by
//! `{conn_id}:{message_id}`. The task's one-shot timer re-pushes the message
//! and rearms until the frontend acks, the retry budget is spent, a push
//! fails, or the connection goes away. Timers are spawned sleeps; aborting
//! the handle cancels the pending fire.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use protocol::Message;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::conn::Connection;
use crate::push::PushFn;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(8);
pub const DEFAULT_MAX_RETRY_CNT: u32 = 3;

/// One pending retransmission.
struct RetransmitTask {
    key: String,
    conn: Arc<Connection>,
    msg: Message,
    timer: Mutex<Option<AbortHandle>>,
    retransmit_cnt: AtomicU32,
}

impl RetransmitTask {
    fn stop(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Owns retransmit tasks and their timers.
pub struct RetransmitManager {
    tasks: DashMap<String, Arc<RetransmitTask>>,
    total_task_cnt: AtomicI64,
    retry_interval: Duration,
    max_retry_cnt: u32,
    push_fn: PushFn,
    closed: AtomicBool,
    /// Handle to ourselves for the spawned timer tasks.
    weak: Weak<RetransmitManager>,
}

impl RetransmitManager {
    /// Non-positive arguments fall back to the defaults (8s / 3).
    pub fn new(retry_interval: Duration, max_retry_cnt: u32, push_fn: PushFn) -> Arc<Self> {
        let retry_interval = if retry_interval.is_zero() {
            DEFAULT_RETRY_INTERVAL
        } else {
            retry_interval
        };
        let max_retry_cnt = if max_retry_cnt == 0 {
            DEFAULT_MAX_RETRY_CNT
        } else {
            max_retry_cnt
        };

        Arc::new_cyclic(|weak| Self {
            tasks: DashMap::new(),
            total_task_cnt: AtomicI64::new(0),
            retry_interval,
            max_retry_cnt,
            push_fn,
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Enrol a task per connection for this message. Existing tasks for the
    /// same `(connection, message)` pair are left untouched.
    pub fn start(&self, conns: &[Arc<Connection>], msg: &Message) {
        for conn in conns {
            self.start_one(conn.clone(), msg.clone());
        }
    }

    fn start_one(&self, conn: Arc<Connection>, msg: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let key = task_key(conn.id(), &msg.message_id);
        let task = Arc::new(RetransmitTask {
            key: key.clone(),
            conn,
            msg,
            timer: Mutex::new(None),
            retransmit_cnt: AtomicU32::new(0),
        });

        match self.tasks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(task.clone());
            }
        }

        self.total_task_cnt.fetch_add(1, Ordering::SeqCst);
        self.arm(&task);
        counter!("synp_retransmit_tasks_total").increment(1);
        debug!(
            conn_id = task.conn.id(),
            message_id = %task.msg.message_id,
            retry_interval = ?self.retry_interval,
            max_retry_cnt = self.max_retry_cnt,
            "retransmit task started"
        );
    }

    fn arm(&self, task: &Arc<RetransmitTask>) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let key = task.key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(manager.retry_interval).await;
            manager.run(&key).await;
        });
        *task.timer.lock().unwrap() = Some(handle.abort_handle());
    }

    /// Timer callback: resend once and rearm, or retire the task.
    async fn run(&self, key: &str) {
        // An ack may have removed the task while the timer was pending.
        let Some(task) = self.tasks.get(key).map(|entry| entry.value().clone()) else {
            return;
        };

        let cnt = task.retransmit_cnt.fetch_add(1, Ordering::SeqCst) + 1;
        if cnt >= self.max_retry_cnt {
            warn!(
                conn_id = task.conn.id(),
                message_id = %task.msg.message_id,
                retransmit_cnt = cnt,
                "retransmit task reached max retry"
            );
            self.stop_and_delete(key);
            return;
        }

        if let Err(err) = (self.push_fn)(task.conn.clone(), task.msg.clone()).await {
            error!(
                conn_id = task.conn.id(),
                message_id = %task.msg.message_id,
                retransmit_cnt = cnt,
                error = %err,
                "failed to retransmit message"
            );
            self.stop_and_delete(key);
            return;
        }

        task.conn.update_activity();
        counter!("synp_retransmits_total").increment(1);
        debug!(
            conn_id = task.conn.id(),
            message_id = %task.msg.message_id,
            retransmit_cnt = cnt,
            "message retransmitted"
        );

        self.arm(&task);
    }

    /// Ack handling: cancel and delete the task for this message.
    pub fn stop(&self, conn_id: &str, message_id: &str) {
        let key = task_key(conn_id, message_id);
        if let Some(task) = self.tasks.get(&key).map(|entry| entry.value().clone()) {
            self.stop_and_delete(&key);
            debug!(
                conn_id,
                message_id,
                retransmit_cnt = task.retransmit_cnt.load(Ordering::SeqCst),
                "retransmit task stopped"
            );
        }
    }

    /// Drop every task bound to one connection.
    pub fn clear_by_conn(&self, conn_id: &str) {
        let keys: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().conn.id() == conn_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = 0;
        for key in keys {
            if self.stop_and_delete(&key) {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(conn_id, cleared, "retransmit tasks cleared for connection");
        }
    }

    /// Idempotent close: stop every remaining task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let mut cleared = 0;
        for key in keys {
            if self.stop_and_delete(&key) {
                cleared += 1;
            }
        }
        info!(cleared, "retransmit manager closed");
    }

    pub fn total_task_cnt(&self) -> i64 {
        self.total_task_cnt.load(Ordering::SeqCst)
    }

    fn stop_and_delete(&self, key: &str) -> bool {
        if let Some((_, task)) = self.tasks.remove(key) {
            task.stop();
            self.total_task_cnt.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

fn task_key(conn_id: &str, message_id: &str) -> String {
    format!("{conn_id}:{message_id}")
}
