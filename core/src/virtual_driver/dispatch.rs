//! 请求分发：直接模式与排队模式，最终都落到 `CallbackRegistry::invoke`。
//!
//! - 直接模式：驱动回调线程上同步执行，不排队；
//! - 排队模式：`sync_*` 调用方把请求压入 FIFO 队列，由固定数量的工作线程取出执行，
//!   调用方阻塞在一次性完成通道上直到结果返回；
//! - 工作线程在队列条件变量上等待时不持有执行许可。
//!
//! 队列关闭有两种方式：`drain` 不再接收新请求但执行完已排队的；
//! `halt` 直接丢弃已排队的请求，调用方收到 `RequestDropped`。

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{VdError, VdResult};
use crate::handlers::OpKind;

use super::callbacks::CallbackRegistry;
use super::gate::ExecutionGate;
use super::lock;
use super::semantics::ReadOutcome;
use super::supervisor::ThreadGroup;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read {
        path: String,
        offset: u64,
        length: usize,
    },
    Write {
        path: String,
        data: Vec<u8>,
    },
    List {
        path: String,
    },
    Exists {
        path: String,
    },
    Size {
        path: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Read { .. } => OpKind::Read,
            Operation::Write { .. } => OpKind::Write,
            Operation::List { .. } => OpKind::List,
            Operation::Exists { .. } => OpKind::Exists,
            Operation::Size { .. } => OpKind::Size,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Operation::Read { path, .. }
            | Operation::Write { path, .. }
            | Operation::List { path }
            | Operation::Exists { path }
            | Operation::Size { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Read(ReadOutcome),
    Written(usize),
    Names(Vec<String>),
    Exists(bool),
    Size(u64),
}

/// 一个排队中的请求；`reply` 被丢弃即表示请求未完成就被丢掉了
struct Request {
    op: Operation,
    reply: SyncSender<VdResult<Outcome>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Accepting,
    Draining,
    Halted,
}

struct QueueState {
    pending: VecDeque<Request>,
    mode: QueueMode,
}

struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

pub struct Dispatcher {
    mount_id: Arc<str>,
    callbacks: Arc<CallbackRegistry>,
    gate: Arc<dyn ExecutionGate>,
    queue: Arc<RequestQueue>,
}

impl Dispatcher {
    pub fn new(
        mount_id: Arc<str>,
        callbacks: Arc<CallbackRegistry>,
        gate: Arc<dyn ExecutionGate>,
    ) -> Self {
        Self {
            mount_id,
            callbacks,
            gate,
            queue: Arc::new(RequestQueue {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    mode: QueueMode::Accepting,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// 启动工作线程（归属于挂载的线程组）
    pub fn start_workers(&self, threads: &Arc<ThreadGroup>, count: usize) -> io::Result<()> {
        for i in 0..count {
            let queue = Arc::clone(&self.queue);
            let callbacks = Arc::clone(&self.callbacks);
            let gate = Arc::clone(&self.gate);
            threads.spawn(&format!("worker{}", i), move || {
                worker_loop(&queue, &callbacks, gate.as_ref())
            })?;
        }
        tracing::debug!(mount_id = %self.mount_id, workers = count, "工作线程已启动");
        Ok(())
    }

    /// 直接模式：在调用线程上执行
    pub fn direct(&self, op: Operation) -> VdResult<Outcome> {
        self.callbacks.invoke(&op, self.gate.as_ref())
    }

    /// 排队模式：入队并阻塞到完成
    pub fn submit(&self, op: Operation) -> VdResult<Outcome> {
        let (tx, rx) = sync_channel(1);
        {
            let mut state = lock(&self.queue.state);
            if state.mode != QueueMode::Accepting {
                return Err(VdError::NotMounted(self.mount_id.to_string()));
            }
            state.pending.push_back(Request { op, reply: tx });
        }
        self.queue.available.notify_one();
        rx.recv()
            .unwrap_or_else(|_| Err(VdError::RequestDropped(self.mount_id.to_string())))
    }

    /// 停止接收新请求；已排队的请求继续执行，执行完后工作线程退出
    pub fn drain(&self) {
        let mut state = lock(&self.queue.state);
        if state.mode == QueueMode::Accepting {
            state.mode = QueueMode::Draining;
        }
        drop(state);
        self.queue.available.notify_all();
    }

    /// 丢弃所有排队请求并让工作线程尽快退出，返回丢弃数量
    pub fn halt(&self) -> usize {
        let dropped: Vec<Request> = {
            let mut state = lock(&self.queue.state);
            state.mode = QueueMode::Halted;
            state.pending.drain(..).collect()
        };
        self.queue.available.notify_all();
        let count = dropped.len();
        if count > 0 {
            tracing::warn!(mount_id = %self.mount_id, dropped = count, "强制卸载丢弃了排队中的请求");
        }
        // 在锁外丢弃，等待方随即收到 RequestDropped
        drop(dropped);
        count
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue.state).pending.len()
    }
}

fn worker_loop(queue: &RequestQueue, callbacks: &CallbackRegistry, gate: &dyn ExecutionGate) {
    loop {
        let request = {
            let mut state = lock(&queue.state);
            loop {
                if state.mode == QueueMode::Halted {
                    return;
                }
                if let Some(request) = state.pending.pop_front() {
                    break request;
                }
                if state.mode == QueueMode::Draining {
                    return;
                }
                state = queue
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        let result = callbacks.invoke(&request.op, gate);
        // 等待方已放弃时发送失败，忽略
        let _ = request.reply.send(result);
    }
}
