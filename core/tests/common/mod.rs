//! 进程内可编排的驱动子系统替身。

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use quarkdrive_core::privilege::FixedPrivilege;
use quarkdrive_core::virtual_driver::{DriverAdapter, DriverError, DriverOptions, DriverSubsystem};
use quarkdrive_core::{BridgeSettings, VirtualDriveService};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// 立即确认挂载；优雅移除即退出
    Succeed,
    /// 注册直接失败
    Fail(DriverError),
    /// 等待一段时间后才确认挂载
    Delay(Duration),
    /// 忽略优雅移除，只响应强制移除
    HangOnRemove,
    /// 两种移除都不响应，直到 `release`
    HangForever,
}

#[derive(Default)]
struct FakeState {
    /// 正在 register 中阻塞的挂载
    active: HashSet<String>,
    graceful: HashSet<String>,
    forced: HashSet<String>,
    ejected: HashSet<String>,
    released: bool,
    adapters: HashMap<String, Arc<DriverAdapter>>,
    registrations: usize,
    remove_calls: Vec<String>,
    force_calls: Vec<String>,
}

pub struct FakeDriver {
    behavior: Mutex<Behavior>,
    state: Mutex<FakeState>,
    changed: Condvar,
}

impl FakeDriver {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            state: Mutex::new(FakeState::default()),
            changed: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// 让所有阻塞中的 register 返回
    pub fn release(&self) {
        self.state().released = true;
        self.changed.notify_all();
    }

    /// 模拟挂载点被外部摘除
    pub fn eject(&self, mount_id: &str) {
        self.state().ejected.insert(mount_id.to_string());
        self.changed.notify_all();
    }

    pub fn adapter(&self, mount_id: &str) -> Option<Arc<DriverAdapter>> {
        self.state().adapters.get(mount_id).cloned()
    }

    pub fn is_active(&self, mount_id: &str) -> bool {
        self.state().active.contains(mount_id)
    }

    pub fn registrations(&self) -> usize {
        self.state().registrations
    }

    pub fn remove_calls(&self) -> Vec<String> {
        self.state().remove_calls.clone()
    }

    pub fn force_calls(&self) -> Vec<String> {
        self.state().force_calls.clone()
    }

    /// 等到挂载点离开驱动（register 返回）
    pub fn wait_inactive(&self, mount_id: &str, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.active.contains(mount_id))
            .unwrap();
        !state.active.contains(mount_id)
    }
}

impl DriverSubsystem for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn register(
        &self,
        mount_id: &str,
        operations: Arc<DriverAdapter>,
        _options: &DriverOptions,
        ready: &mut dyn FnMut(),
    ) -> Result<(), DriverError> {
        let behavior = self.behavior();
        match &behavior {
            Behavior::Fail(e) => return Err(e.clone()),
            Behavior::Delay(d) => std::thread::sleep(*d),
            _ => {}
        }

        {
            let mut state = self.state();
            state.registrations += 1;
            state.active.insert(mount_id.to_string());
            state.graceful.remove(mount_id);
            state.forced.remove(mount_id);
            state.ejected.remove(mount_id);
            state.adapters.insert(mount_id.to_string(), operations);
        }
        ready();

        let mut state = self.state();
        loop {
            let graceful = state.graceful.contains(mount_id)
                && matches!(behavior, Behavior::Succeed | Behavior::Delay(_));
            let forced =
                state.forced.contains(mount_id) && !matches!(behavior, Behavior::HangForever);
            if graceful || forced || state.released || state.ejected.contains(mount_id) {
                break;
            }
            state = self.changed.wait(state).unwrap();
        }
        state.active.remove(mount_id);
        state.adapters.remove(mount_id);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn remove_mount_point(&self, mount_id: &str) {
        let mut state = self.state();
        state.remove_calls.push(mount_id.to_string());
        state.graceful.insert(mount_id.to_string());
        drop(state);
        self.changed.notify_all();
    }

    fn force_remove_mount_point(&self, mount_id: &str) -> bool {
        let mut state = self.state();
        state.force_calls.push(mount_id.to_string());
        state.forced.insert(mount_id.to_string());
        drop(state);
        self.changed.notify_all();
        !matches!(self.behavior(), Behavior::HangForever)
    }
}

/// 测试用的短超时配置
pub fn fast_settings() -> BridgeSettings {
    let mut settings = BridgeSettings::default();
    settings.startup_timeout_ms = 2_000;
    settings.graceful_unmount_timeout_ms = 300;
    settings.forced_unmount_timeout_ms = 300;
    settings.worker_count = 2;
    settings
}

pub fn service_with(driver: Arc<FakeDriver>, settings: BridgeSettings) -> Arc<VirtualDriveService> {
    VirtualDriveService::builder()
        .settings(settings)
        .driver(driver)
        .privilege_checker(Arc::new(FixedPrivilege(false)))
        .build()
        .unwrap()
}

pub fn service(driver: Arc<FakeDriver>) -> Arc<VirtualDriveService> {
    service_with(driver, fast_settings())
}
