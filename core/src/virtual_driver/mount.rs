//! 单个挂载的状态机：Unmounted → Mounting → Mounted → Unmounting → Unmounted。
//!
//! 挂载确认通过条件变量等待，不轮询。超时与迟到的 `ready` 在同一把状态锁下裁决：
//! 超时先到则状态直接落到 Unmounted，迟到的 `mark_registered` 返回 false，
//! 由驱动线程负责把刚出现的挂载点摘掉。报告过失败的挂载不会再变成 Mounted。

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::VdError;

use super::callbacks::CallbackRegistry;
use super::dispatch::Dispatcher;
use super::gate::ExecutionGate;
use super::last_error::ErrorSlot;
use super::lock;
use super::registry::MountRegistry;
use super::supervisor::{Reaper, ThreadGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

impl MountState {
    /// 在挂载表中对外可见（可被解析、出现在 list_mounts 中）
    pub fn is_visible(self) -> bool {
        matches!(self, MountState::Mounting | MountState::Mounted)
    }
}

#[derive(Debug)]
pub(crate) enum Registration {
    Mounted,
    Failed(VdError),
    TimedOut,
}

struct Phase {
    state: MountState,
    failure: Option<VdError>,
}

pub struct Mount {
    id: Arc<str>,
    backend: String,
    phase: Mutex<Phase>,
    phase_changed: Condvar,
    callbacks: Arc<CallbackRegistry>,
    dispatcher: Dispatcher,
    threads: Arc<ThreadGroup>,
    last_error: ErrorSlot,
    process_errors: Arc<ErrorSlot>,
}

impl Mount {
    pub(crate) fn new(
        id: &str,
        backend: &str,
        gate: Arc<dyn ExecutionGate>,
        process_errors: Arc<ErrorSlot>,
    ) -> Self {
        let id: Arc<str> = Arc::from(id);
        let callbacks = Arc::new(CallbackRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&id), Arc::clone(&callbacks), gate);
        Self {
            threads: ThreadGroup::new(id.as_ref()),
            id,
            backend: backend.to_string(),
            phase: Mutex::new(Phase {
                state: MountState::Mounting,
                failure: None,
            }),
            phase_changed: Condvar::new(),
            callbacks,
            dispatcher,
            last_error: ErrorSlot::new(),
            process_errors,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn state(&self) -> MountState {
        lock(&self.phase).state
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn threads(&self) -> &Arc<ThreadGroup> {
        &self.threads
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    /// 同时写入挂载级与进程级错误槽
    pub(crate) fn record_error(&self, message: &str) {
        self.last_error.record(message);
        self.process_errors.record(message);
    }

    /// 驱动确认挂载可见。只有仍在 Mounting 时才生效。
    pub(crate) fn mark_registered(&self) -> bool {
        let mut phase = lock(&self.phase);
        if phase.state != MountState::Mounting {
            return false;
        }
        phase.state = MountState::Mounted;
        drop(phase);
        self.phase_changed.notify_all();
        tracing::info!(mount_id = %self.id, "虚拟盘已挂载");
        true
    }

    pub(crate) fn mark_failed(&self, error: VdError) {
        let mut phase = lock(&self.phase);
        if phase.state == MountState::Mounting {
            phase.state = MountState::Unmounted;
            phase.failure = Some(error);
        }
        drop(phase);
        self.phase_changed.notify_all();
    }

    /// 等待挂载结果；超时即取消这次尝试（状态置为 Unmounted）
    pub(crate) fn await_registration(&self, timeout: Duration) -> Registration {
        let deadline = Instant::now() + timeout;
        let mut phase = lock(&self.phase);
        while phase.state == MountState::Mounting {
            let now = Instant::now();
            if now >= deadline {
                phase.state = MountState::Unmounted;
                drop(phase);
                self.phase_changed.notify_all();
                return Registration::TimedOut;
            }
            phase = match self.phase_changed.wait_timeout(phase, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        match phase.state {
            MountState::Mounted => Registration::Mounted,
            _ => Registration::Failed(phase.failure.take().unwrap_or_else(|| {
                VdError::RegistrationFailed {
                    id: self.id.to_string(),
                    reason: "驱动在确认挂载前退出".to_string(),
                }
            })),
        }
    }

    /// Mounted → Unmounting；并发卸载只有一个能成功
    pub(crate) fn begin_unmount(&self) -> bool {
        let mut phase = lock(&self.phase);
        if phase.state != MountState::Mounted {
            return false;
        }
        phase.state = MountState::Unmounting;
        true
    }

    pub(crate) fn finish_unmount(&self) {
        lock(&self.phase).state = MountState::Unmounted;
        self.phase_changed.notify_all();
    }

    /// 驱动生命周期线程在 `register` 返回后调用
    pub(crate) fn driver_exited(
        self: &Arc<Self>,
        result: Result<(), VdError>,
        registry: &MountRegistry,
        reaper: &Reaper,
    ) {
        let mut phase = lock(&self.phase);
        match phase.state {
            MountState::Mounting => {
                phase.state = MountState::Unmounted;
                phase.failure = Some(result.err().unwrap_or_else(|| {
                    VdError::RegistrationFailed {
                        id: self.id.to_string(),
                        reason: "驱动在确认挂载前退出".to_string(),
                    }
                }));
                drop(phase);
                self.phase_changed.notify_all();
            }
            MountState::Mounted => {
                // 挂载点被外部摘除（用户手动卸载、驱动崩溃等）
                phase.state = MountState::Unmounted;
                drop(phase);
                self.phase_changed.notify_all();
                let message = match result {
                    Ok(()) => format!("虚拟盘被外部卸载: {}", self.id),
                    Err(e) => format!("虚拟盘意外退出（{}）: {}", self.id, e),
                };
                tracing::warn!(mount_id = %self.id, "{}", message);
                self.record_error(&message);
                registry.remove_if_same(self);
                self.dispatcher.halt();
                reaper.adopt(Arc::clone(&self.threads));
            }
            MountState::Unmounting | MountState::Unmounted => {
                drop(phase);
                if let Err(e) = result {
                    tracing::debug!(mount_id = %self.id, "驱动退出: {}", e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_driver::gate::FreeThreaded;
    use std::thread;

    fn mount() -> Arc<Mount> {
        Arc::new(Mount::new(
            "Z",
            "test",
            Arc::new(FreeThreaded),
            Arc::new(ErrorSlot::new()),
        ))
    }

    #[test]
    fn test_registration_wakes_waiter() {
        let m = mount();
        let m2 = Arc::clone(&m);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            m2.mark_registered()
        });
        assert!(matches!(
            m.await_registration(Duration::from_secs(5)),
            Registration::Mounted
        ));
        assert!(t.join().unwrap());
        assert_eq!(m.state(), MountState::Mounted);
    }

    #[test]
    fn test_timeout_wins_over_late_ready() {
        let m = mount();
        assert!(matches!(
            m.await_registration(Duration::from_millis(10)),
            Registration::TimedOut
        ));
        assert_eq!(m.state(), MountState::Unmounted);
        // 迟到的确认不会让它“复活”
        assert!(!m.mark_registered());
        assert_eq!(m.state(), MountState::Unmounted);
    }

    #[test]
    fn test_failure_is_reported() {
        let m = mount();
        m.mark_failed(VdError::DriverUnavailable("no driver".to_string()));
        match m.await_registration(Duration::from_secs(1)) {
            Registration::Failed(VdError::DriverUnavailable(msg)) => assert_eq!(msg, "no driver"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_begin_unmount_only_once() {
        let m = mount();
        assert!(!m.begin_unmount());
        assert!(m.mark_registered());
        assert!(m.begin_unmount());
        assert!(!m.begin_unmount());
        m.finish_unmount();
        assert_eq!(m.state(), MountState::Unmounted);
    }

    #[test]
    fn test_unexpected_driver_exit_removes_mount() {
        let registry = MountRegistry::new();
        let reaper = Reaper::new();
        let m = mount();
        registry.reserve(Arc::clone(&m)).unwrap();
        assert!(m.mark_registered());

        m.driver_exited(Ok(()), &registry, &reaper);
        assert_eq!(m.state(), MountState::Unmounted);
        assert!(registry.get("Z").is_none());
        assert!(m.last_error().is_some());
    }
}
