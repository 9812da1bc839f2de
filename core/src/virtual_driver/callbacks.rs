//! 每个挂载一份的回调注册表。
//!
//! 槽位整体存放在 `ArcSwap<HandlerSet>` 中：
//! - `set_handlers` 以 rcu 方式合并替换，未提供的槽位保持不变；
//! - `invoke` 先取快照再调用，调用期间不持有任何注册表锁，
//!   正在执行的请求始终使用调用开始时的那一份回调。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{HandlerResult, VdError, VdResult};
use crate::handlers::{HandlerSet, OpKind};

use super::dispatch::{Operation, Outcome};
use super::gate::ExecutionGate;
use super::semantics::clip_read;

pub struct CallbackRegistry {
    slots: ArcSwap<HandlerSet>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self {
            slots: ArcSwap::from_pointee(HandlerSet::new()),
        }
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handlers(&self, update: HandlerSet) {
        self.slots.rcu(|current| update.merged_over(current));
    }

    pub fn snapshot(&self) -> Arc<HandlerSet> {
        self.slots.load_full()
    }

    pub fn installed(&self) -> Vec<OpKind> {
        self.slots.load().installed()
    }

    /// 执行一次操作。回调返回错误或 panic 都会变成 `HandlerFault`。
    pub fn invoke(&self, op: &Operation, gate: &dyn ExecutionGate) -> VdResult<Outcome> {
        let handlers = self.snapshot();
        let result = {
            let _permit = gate.enter();
            panic::catch_unwind(AssertUnwindSafe(|| call(&handlers, op)))
        };
        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(VdError::handler_fault(op.kind(), op.path(), e.0)),
            Err(payload) => Err(VdError::handler_fault(
                op.kind(),
                op.path(),
                format!("panic: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

/// 未设置的槽位使用默认行为
fn call(handlers: &HandlerSet, op: &Operation) -> HandlerResult<Outcome> {
    match op {
        Operation::Read {
            path,
            offset,
            length,
        } => {
            let data = match &handlers.read {
                Some(h) => h.read(path)?,
                None => Vec::new(),
            };
            Ok(Outcome::Read(clip_read(data, *offset, *length)))
        }
        Operation::Write { path, data } => {
            if let Some(h) = &handlers.write {
                h.write(path, data)?;
            }
            Ok(Outcome::Written(data.len()))
        }
        Operation::List { path } => match &handlers.list {
            Some(h) => h.list(path).map(Outcome::Names),
            None => Ok(Outcome::Names(Vec::new())),
        },
        Operation::Exists { path } => match &handlers.exists {
            Some(h) => h.exists(path).map(Outcome::Exists),
            None => Ok(Outcome::Exists(false)),
        },
        Operation::Size { path } => match &handlers.size {
            Some(h) => h.size(path).map(Outcome::Size),
            None => Ok(Outcome::Size(0)),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::virtual_driver::gate::FreeThreaded;

    fn read(path: &str, offset: u64, length: usize) -> Operation {
        Operation::Read {
            path: path.to_string(),
            offset,
            length,
        }
    }

    #[test]
    fn test_defaults_when_unset() {
        let registry = CallbackRegistry::new();
        let gate = FreeThreaded;
        assert_eq!(
            registry.invoke(&read("/a", 0, 10), &gate),
            Ok(Outcome::Read(clip_read(Vec::new(), 0, 10)))
        );
        let write = Operation::Write {
            path: "/a".to_string(),
            data: vec![1, 2, 3],
        };
        assert_eq!(registry.invoke(&write, &gate), Ok(Outcome::Written(3)));
        let list = Operation::List {
            path: "/".to_string(),
        };
        assert_eq!(registry.invoke(&list, &gate), Ok(Outcome::Names(Vec::new())));
        let exists = Operation::Exists {
            path: "/a".to_string(),
        };
        assert_eq!(registry.invoke(&exists, &gate), Ok(Outcome::Exists(false)));
        let size = Operation::Size {
            path: "/a".to_string(),
        };
        assert_eq!(registry.invoke(&size, &gate), Ok(Outcome::Size(0)));
    }

    #[test]
    fn test_partial_update_keeps_existing_slots() {
        let registry = CallbackRegistry::new();
        registry.set_handlers(
            HandlerSet::new()
                .with_read(|_: &str| -> HandlerResult<Vec<u8>> { Ok(b"v1".to_vec()) })
                .with_size(|_: &str| -> HandlerResult<u64> { Ok(2) }),
        );
        registry.set_handlers(HandlerSet::new().with_read(|_: &str| -> HandlerResult<Vec<u8>> { Ok(b"v2".to_vec()) }));
        assert_eq!(registry.installed(), vec![OpKind::Read, OpKind::Size]);

        let out = registry.invoke(&read("/f", 0, 16), &FreeThreaded).unwrap();
        assert_eq!(out, Outcome::Read(clip_read(b"v2".to_vec(), 0, 16)));
    }

    #[test]
    fn test_error_and_panic_become_handler_fault() {
        let registry = CallbackRegistry::new();
        registry.set_handlers(
            HandlerSet::new()
                .with_read(|_: &str| -> HandlerResult<Vec<u8>> { Err(HandlerError::new("disk on fire")) })
                .with_size(|_: &str| -> HandlerResult<u64> { panic!("size exploded") }),
        );

        match registry.invoke(&read("/f", 0, 4), &FreeThreaded) {
            Err(VdError::HandlerFault { op, path, message }) => {
                assert_eq!(op, OpKind::Read);
                assert_eq!(path, "/f");
                assert_eq!(message, "disk on fire");
            }
            other => panic!("unexpected: {:?}", other),
        }

        let size = Operation::Size {
            path: "/f".to_string(),
        };
        match registry.invoke(&size, &FreeThreaded) {
            Err(VdError::HandlerFault { message, .. }) => {
                assert!(message.contains("size exploded"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_in_flight_call_keeps_its_snapshot() {
        use std::sync::mpsc;
        use std::thread;

        let registry = Arc::new(CallbackRegistry::new());
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = std::sync::Mutex::new(go_rx);
        let entered_tx = std::sync::Mutex::new(entered_tx);
        registry.set_handlers(HandlerSet::new().with_read(move |_: &str| -> HandlerResult<Vec<u8>> {
            let _ = entered_tx.lock().unwrap().send(());
            let _ = go_rx.lock().unwrap().recv();
            Ok(b"old".to_vec())
        }));

        let r = Arc::clone(&registry);
        let worker = thread::spawn(move || r.invoke(&read("/f", 0, 8), &FreeThreaded));
        entered_rx.recv().unwrap();

        // 调用进行中替换回调：不阻塞，也不影响正在执行的那一次
        registry.set_handlers(HandlerSet::new().with_read(|_: &str| -> HandlerResult<Vec<u8>> { Ok(b"new".to_vec()) }));
        go_tx.send(()).unwrap();

        let first = worker.join().unwrap().unwrap();
        assert_eq!(first, Outcome::Read(clip_read(b"old".to_vec(), 0, 8)));
        let second = registry.invoke(&read("/f", 0, 8), &FreeThreaded).unwrap();
        assert_eq!(second, Outcome::Read(clip_read(b"new".to_vec(), 0, 8)));
    }
}
