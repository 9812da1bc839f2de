//! 回调执行许可。
//!
//! 宿主运行时若要求同一时刻只有一个线程执行其代码（例如带全局解释器锁的脚本运行时），
//! 使用 `ExclusiveGate`；回调本身线程安全时使用 `FreeThreaded`。
//! 许可只在回调函数体执行期间持有，等待队列、等待挂载确认时都不持有。

use std::sync::{Mutex, MutexGuard};

pub trait ExecutionGate: Send + Sync {
    fn enter(&self) -> GateGuard<'_>;
}

/// 离开作用域即释放许可
pub struct GateGuard<'a> {
    _held: Option<MutexGuard<'a, ()>>,
}

impl GateGuard<'_> {
    pub fn free() -> Self {
        Self { _held: None }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FreeThreaded;

impl ExecutionGate for FreeThreaded {
    fn enter(&self) -> GateGuard<'_> {
        GateGuard::free()
    }
}

#[derive(Debug, Default)]
pub struct ExclusiveGate {
    permit: Mutex<()>,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionGate for ExclusiveGate {
    fn enter(&self) -> GateGuard<'_> {
        // 回调 panic 会毒化锁；许可本身不保护数据，直接取回
        let held = self
            .permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        GateGuard { _held: Some(held) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_exclusive_gate_serializes() {
        let gate = Arc::new(ExclusiveGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _permit = gate.enter();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_recovers_after_panic() {
        let gate = Arc::new(ExclusiveGate::new());
        let g = Arc::clone(&gate);
        let _ = thread::spawn(move || {
            let _permit = g.enter();
            panic!("handler blew up");
        })
        .join();
        let _permit = gate.enter();
    }
}
