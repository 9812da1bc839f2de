//! 挂载相关线程的归属与回收。
//!
//! 每个挂载拥有一个 `ThreadGroup`（驱动生命周期线程 + sync_* 工作线程）。
//! 卸载时先 `wait_quiesced`，确认全部退出后再 join；
//! 没能退出的线程组交给 `Reaper` 托管，由服务关闭时统一回收，绝不在未退出时 join 阻塞。

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::lock;

#[derive(Default)]
pub struct ThreadGroup {
    name: String,
    live: Mutex<usize>,
    changed: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// 线程退出（包括 panic 展开）时减计数
struct LiveGuard(Arc<ThreadGroup>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = lock(&self.0.live);
        *live = live.saturating_sub(1);
        self.0.changed.notify_all();
    }
}

impl ThreadGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn<F>(self: &Arc<Self>, label: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.live) += 1;
        let guard = LiveGuard(Arc::clone(self));
        let spawned = thread::Builder::new()
            .name(format!("qd-{}-{}", self.name, label))
            .spawn(move || {
                let _guard = guard;
                f();
            });
        match spawned {
            Ok(handle) => {
                lock(&self.handles).push(handle);
                Ok(())
            }
            // 闭包（连同 guard）已随 Err 一起被丢弃，计数已回退
            Err(e) => Err(e),
        }
    }

    pub fn live(&self) -> usize {
        *lock(&self.live)
    }

    /// 等待组内线程全部退出；超时返回 false
    pub fn wait_quiesced(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = lock(&self.live);
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            live = match self.changed.wait_timeout(live, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// join 所有已退出的线程；只应在 `wait_quiesced` 返回 true 后调用
    pub fn join_all(&self) {
        for handle in self.take_handles() {
            if handle.join().is_err() {
                tracing::warn!(group = %self.name, "线程以 panic 结束");
            }
        }
    }

    pub fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *lock(&self.handles))
    }
}

/// 托管未能按时退出的线程组
#[derive(Default)]
pub struct Reaper {
    adopted: Mutex<Vec<Arc<ThreadGroup>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// 托管前先回收已经退出的组，托管列表不会无限增长
    pub fn adopt(&self, group: Arc<ThreadGroup>) {
        self.reap();
        tracing::warn!(group = %group.name(), live = group.live(), "线程组未退出，交由回收器托管");
        lock(&self.adopted).push(group);
    }

    pub fn adopted_count(&self) -> usize {
        lock(&self.adopted).len()
    }

    /// 回收已经退出的线程组，返回仍未退出的数量
    pub fn reap(&self) -> usize {
        let mut adopted = lock(&self.adopted);
        adopted.retain(|group| {
            if group.live() == 0 {
                group.join_all();
                false
            } else {
                true
            }
        });
        adopted.len()
    }

    /// 关闭时调用：给每个组一次等待机会，仍未退出的只记录日志并分离
    pub fn shutdown(&self, grace: Duration) {
        let groups = std::mem::take(&mut *lock(&self.adopted));
        for group in groups {
            if group.wait_quiesced(grace) {
                group.join_all();
            } else {
                let detached = group.take_handles().len();
                tracing::error!(
                    group = %group.name(),
                    live = group.live(),
                    detached,
                    "线程组在关闭时仍未退出，已分离"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_wait_quiesced_and_join() {
        let group = ThreadGroup::new("t");
        let (tx, rx) = mpsc::channel::<()>();
        group.spawn("worker", move || {
            let _ = rx.recv();
        })
        .unwrap();
        assert_eq!(group.live(), 1);
        assert!(!group.wait_quiesced(Duration::from_millis(30)));

        drop(tx);
        assert!(group.wait_quiesced(Duration::from_secs(5)));
        group.join_all();
        assert_eq!(group.live(), 0);
    }

    #[test]
    fn test_panicking_thread_still_counts_down() {
        let group = ThreadGroup::new("p");
        group.spawn("boom", || panic!("boom")).unwrap();
        assert!(group.wait_quiesced(Duration::from_secs(5)));
        group.join_all();
    }

    #[test]
    fn test_reaper_collects_finished_groups() {
        let reaper = Reaper::new();
        let group = ThreadGroup::new("r");
        let (tx, rx) = mpsc::channel::<()>();
        group.spawn("stuck", move || {
            let _ = rx.recv();
        })
        .unwrap();
        reaper.adopt(Arc::clone(&group));
        assert_eq!(reaper.reap(), 1);

        drop(tx);
        assert!(group.wait_quiesced(Duration::from_secs(5)));
        assert_eq!(reaper.reap(), 0);
        assert_eq!(reaper.adopted_count(), 0);
    }

    #[test]
    fn test_adopt_collects_finished_groups_first() {
        let reaper = Reaper::new();
        for i in 0..5 {
            let group = ThreadGroup::new(format!("g{}", i));
            group.spawn("quick", || {}).unwrap();
            assert!(group.wait_quiesced(Duration::from_secs(5)));
            reaper.adopt(group);
        }
        assert_eq!(reaper.adopted_count(), 1);
    }
}
