//! 虚拟盘服务：宿主可见的全部边界操作。
//!
//! 服务对象持有挂载表、进程级错误槽、驱动子系统、权限查询、执行许可与配置，
//! 进程启动时构建一次，以 `Arc` 形式传给各入口。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{VdError, VdResult};
use crate::handlers::HandlerSet;
use crate::privilege::{OsPrivilegeChecker, PrivilegeChecker};
use crate::settings::BridgeSettings;

use super::adapter::DriverAdapter;
use super::dispatch::{Operation, Outcome};
use super::driver_service::{default_driver, DriverOptions, DriverSubsystem};
use super::gate::{ExecutionGate, FreeThreaded};
use super::last_error::ErrorSlot;
use super::mount::{Mount, MountState, Registration};
use super::registry::MountRegistry;
use super::semantics::ReadOutcome;
use super::supervisor::Reaper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmountOutcome {
    /// 优雅卸载，线程全部退出
    Clean,
    /// 走了强制移除，线程在强制等待期内退出
    Forced,
    /// 强制移除后线程仍未退出（已交给回收器）
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmountReport {
    pub id: String,
    pub outcome: UnmountOutcome,
    /// 强制卸载时丢弃的排队请求数
    pub dropped_requests: usize,
}

impl UnmountReport {
    /// 资源是否确认已清理
    pub fn is_clean(&self) -> bool {
        self.outcome != UnmountOutcome::TimedOut
    }
}

pub struct VirtualDriveServiceBuilder {
    settings: BridgeSettings,
    driver: Option<Arc<dyn DriverSubsystem>>,
    privilege: Option<Arc<dyn PrivilegeChecker>>,
    gate: Option<Arc<dyn ExecutionGate>>,
}

impl VirtualDriveServiceBuilder {
    pub fn settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn DriverSubsystem>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn privilege_checker(mut self, checker: Arc<dyn PrivilegeChecker>) -> Self {
        self.privilege = Some(checker);
        self
    }

    pub fn execution_gate(mut self, gate: Arc<dyn ExecutionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn build(self) -> VdResult<Arc<VirtualDriveService>> {
        self.settings.validate()?;
        let driver = self.driver.unwrap_or_else(default_driver);
        tracing::debug!(driver = driver.name(), "虚拟盘服务已创建");
        Ok(Arc::new(VirtualDriveService {
            registry: Arc::new(MountRegistry::new()),
            errors: Arc::new(ErrorSlot::new()),
            driver,
            privilege: self
                .privilege
                .unwrap_or_else(|| Arc::new(OsPrivilegeChecker)),
            gate: self.gate.unwrap_or_else(|| Arc::new(FreeThreaded)),
            settings: self.settings,
            reaper: Arc::new(Reaper::new()),
            shut_down: AtomicBool::new(false),
        }))
    }
}

pub struct VirtualDriveService {
    registry: Arc<MountRegistry>,
    errors: Arc<ErrorSlot>,
    driver: Arc<dyn DriverSubsystem>,
    privilege: Arc<dyn PrivilegeChecker>,
    gate: Arc<dyn ExecutionGate>,
    settings: BridgeSettings,
    reaper: Arc<Reaper>,
    shut_down: AtomicBool,
}

impl VirtualDriveService {
    pub fn builder() -> VirtualDriveServiceBuilder {
        VirtualDriveServiceBuilder {
            settings: BridgeSettings::default(),
            driver: None,
            privilege: None,
            gate: None,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn validate_id<'a>(&self, id: &'a str) -> VdResult<&'a str> {
        let id = id.trim();
        if id.is_empty() || id.chars().count() > self.settings.max_mount_id_len {
            return Err(VdError::InvalidIdentifier(id.to_string()));
        }
        Ok(id)
    }

    /// 记录错误：进程级错误槽总是更新，挂载存在时也写入挂载级错误槽
    fn record(&self, mount: Option<&Mount>, error: &VdError) {
        let message = error.to_string();
        match mount {
            Some(m) => m.record_error(&message),
            None => self.errors.record(message.as_str()),
        }
        if error.is_warning() {
            tracing::warn!("{}", message);
        } else {
            tracing::error!("{}", message);
        }
    }

    /// 挂载；只有状态在返回时确认为 Mounted 才返回 Ok
    pub fn try_mount(&self, id: &str, backend: &str) -> VdResult<()> {
        let result = self.mount_inner(id, backend);
        if let Err(e) = &result {
            self.record(None, e);
        }
        result
    }

    pub fn mount(&self, id: &str, backend: &str) -> bool {
        self.try_mount(id, backend).is_ok()
    }

    fn mount_inner(&self, id: &str, backend: &str) -> VdResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(VdError::DriverUnavailable("虚拟盘服务已关闭".to_string()));
        }
        let id = self.validate_id(id)?;
        let mount = Arc::new(Mount::new(
            id,
            backend,
            Arc::clone(&self.gate),
            Arc::clone(&self.errors),
        ));
        self.registry.reserve(Arc::clone(&mount))?;
        tracing::info!(mount_id = id, backend, driver = self.driver.name(), "开始挂载虚拟盘");

        if let Err(e) = mount
            .dispatcher()
            .start_workers(mount.threads(), self.settings.worker_count)
        {
            self.discard(&mount);
            return Err(VdError::RegistrationFailed {
                id: id.to_string(),
                reason: format!("启动工作线程失败: {}", e),
            });
        }

        if let Err(e) = self.spawn_lifecycle(&mount) {
            self.discard(&mount);
            return Err(VdError::RegistrationFailed {
                id: id.to_string(),
                reason: format!("启动驱动线程失败: {}", e),
            });
        }

        let timeout = self.settings.startup_timeout();
        match mount.await_registration(timeout) {
            Registration::Mounted => Ok(()),
            Registration::Failed(e) => {
                self.discard(&mount);
                Err(e)
            }
            Registration::TimedOut => {
                tracing::warn!(mount_id = id, ?timeout, "挂载确认超时，已取消本次挂载");
                self.abandon(&mount);
                Err(VdError::RegistrationTimeout {
                    id: id.to_string(),
                    timeout,
                })
            }
        }
    }

    /// 驱动生命周期线程：阻塞在 `register` 上直到挂载点被移除
    fn spawn_lifecycle(&self, mount: &Arc<Mount>) -> std::io::Result<()> {
        let mount_for_thread = Arc::clone(mount);
        let driver = Arc::clone(&self.driver);
        let registry = Arc::clone(&self.registry);
        let reaper = Arc::clone(&self.reaper);
        let adapter = Arc::new(DriverAdapter::new(
            mount.id(),
            Arc::clone(&self.registry),
            self.settings.volume.clone(),
        ));
        let options = DriverOptions::from_settings(mount.id(), &self.settings);

        mount.threads().spawn("driver", move || {
            let mount = mount_for_thread;
            let id = mount.id().to_string();
            let mut ready = || {
                if !mount.mark_registered() {
                    // 这次尝试已被超时取消：刚出现的挂载点不能留下
                    tracing::warn!(mount_id = %id, "挂载确认迟到，移除挂载点");
                    driver.remove_mount_point(&id);
                }
            };
            let result = driver.register(&id, adapter, &options, &mut ready);
            let result = result.map_err(|e| e.into_vd_error(&id));
            mount.driver_exited(result, &registry, &reaper);
        })
    }

    /// 撤销一次失败的挂载尝试（驱动线程已返回或未启动）：移出挂载表、停掉工作线程
    fn discard(&self, mount: &Arc<Mount>) {
        self.registry.remove_if_same(mount);
        mount.dispatcher().halt();
        if mount
            .threads()
            .wait_quiesced(self.settings.forced_unmount_timeout())
        {
            mount.threads().join_all();
        } else {
            self.reaper.adopt(Arc::clone(mount.threads()));
        }
    }

    /// 放弃一次超时的挂载尝试。驱动线程仍阻塞在 `register` 中，不等待，直接托管
    fn abandon(&self, mount: &Arc<Mount>) {
        self.registry.remove_if_same(mount);
        mount.dispatcher().halt();
        self.reaper.adopt(Arc::clone(mount.threads()));
    }

    /// 回收器中尚未回收的线程组数量
    pub fn lingering_thread_groups(&self) -> usize {
        self.reaper.adopted_count()
    }

    /// 卸载。无论强制移除是否成功，挂载都会被置为 Unmounted 并移出挂载表。
    pub fn try_unmount(&self, id: &str) -> VdResult<UnmountReport> {
        let id = id.trim();
        let mount = match self.registry.get(id) {
            Some(m) if m.begin_unmount() => m,
            _ => {
                let e = VdError::NotMounted(id.to_string());
                self.record(None, &e);
                return Err(e);
            }
        };
        tracing::info!(mount_id = id, "开始卸载虚拟盘");

        self.driver.remove_mount_point(id);
        mount.dispatcher().drain();

        let mut dropped_requests = 0;
        let outcome = if mount
            .threads()
            .wait_quiesced(self.settings.graceful_unmount_timeout())
        {
            UnmountOutcome::Clean
        } else {
            tracing::warn!(mount_id = id, live = mount.threads().live(), "优雅卸载超时，强制移除");
            let accepted = self.driver.force_remove_mount_point(id);
            dropped_requests = mount.dispatcher().halt();
            if !accepted {
                tracing::warn!(mount_id = id, "驱动未接受强制移除");
            }
            if mount
                .threads()
                .wait_quiesced(self.settings.forced_unmount_timeout())
            {
                UnmountOutcome::Forced
            } else {
                UnmountOutcome::TimedOut
            }
        };

        mount.finish_unmount();
        self.registry.remove_if_same(&mount);

        match outcome {
            UnmountOutcome::Clean | UnmountOutcome::Forced => mount.threads().join_all(),
            UnmountOutcome::TimedOut => self.reaper.adopt(Arc::clone(mount.threads())),
        }
        match outcome {
            UnmountOutcome::Clean => {}
            UnmountOutcome::Forced => {
                self.record(Some(&mount), &VdError::UnmountForced(id.to_string()))
            }
            UnmountOutcome::TimedOut => {
                self.record(Some(&mount), &VdError::UnmountTimeout(id.to_string()))
            }
        }
        tracing::info!(mount_id = id, ?outcome, dropped_requests, "虚拟盘已卸载");

        Ok(UnmountReport {
            id: id.to_string(),
            outcome,
            dropped_requests,
        })
    }

    /// true：资源确认已清理（Clean / Forced）
    pub fn unmount(&self, id: &str) -> bool {
        self.try_unmount(id)
            .map(|report| report.is_clean())
            .unwrap_or(false)
    }

    /// 替换部分回调；未提供的槽位保持不变
    pub fn set_handlers(&self, id: &str, handlers: HandlerSet) -> VdResult<()> {
        let id = id.trim();
        match self.registry.resolve(id) {
            Some(mount) => {
                tracing::debug!(mount_id = id, installed = ?handlers.installed(), "更新回调");
                mount.callbacks().set_handlers(handlers);
                Ok(())
            }
            None => {
                let e = VdError::NotMounted(id.to_string());
                self.record(None, &e);
                Err(e)
            }
        }
    }

    pub fn list_mounts(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// 排队模式提交；只接受已挂载的盘
    fn submit(&self, id: &str, op: Operation) -> VdResult<Outcome> {
        let id = id.trim();
        let mount = self
            .registry
            .resolve(id)
            .filter(|m| m.state() == MountState::Mounted)
            .ok_or_else(|| VdError::NotMounted(id.to_string()));
        let mount = match mount {
            Ok(m) => m,
            Err(e) => {
                self.record(None, &e);
                return Err(e);
            }
        };
        mount.dispatcher().submit(op).map_err(|e| {
            self.record(Some(&mount), &e);
            e
        })
    }

    pub fn sync_read(
        &self,
        id: &str,
        path: &str,
        capacity: usize,
        offset: u64,
    ) -> VdResult<ReadOutcome> {
        let op = Operation::Read {
            path: path.to_string(),
            offset,
            length: capacity,
        };
        match self.submit(id, op)? {
            Outcome::Read(out) => Ok(out),
            other => Err(unexpected(id, path, other)),
        }
    }

    pub fn sync_write(&self, id: &str, path: &str, data: &[u8]) -> VdResult<usize> {
        let op = Operation::Write {
            path: path.to_string(),
            data: data.to_vec(),
        };
        match self.submit(id, op)? {
            Outcome::Written(n) => Ok(n),
            other => Err(unexpected(id, path, other)),
        }
    }

    pub fn sync_list(&self, id: &str, path: &str) -> VdResult<Vec<String>> {
        let op = Operation::List {
            path: path.to_string(),
        };
        match self.submit(id, op)? {
            Outcome::Names(names) => Ok(names),
            other => Err(unexpected(id, path, other)),
        }
    }

    pub fn sync_exists(&self, id: &str, path: &str) -> VdResult<bool> {
        let op = Operation::Exists {
            path: path.to_string(),
        };
        match self.submit(id, op)? {
            Outcome::Exists(b) => Ok(b),
            other => Err(unexpected(id, path, other)),
        }
    }

    pub fn sync_size(&self, id: &str, path: &str) -> VdResult<u64> {
        let op = Operation::Size {
            path: path.to_string(),
        };
        match self.submit(id, op)? {
            Outcome::Size(n) => Ok(n),
            other => Err(unexpected(id, path, other)),
        }
    }

    /// 进程级最近一次错误；没有时为空串
    pub fn get_last_error(&self) -> String {
        self.errors.get().unwrap_or_default()
    }

    pub fn is_mount_in_progress(&self) -> bool {
        self.registry.any_in_state(MountState::Mounting)
    }

    pub fn has_elevated_privileges(&self) -> bool {
        self.privilege.has_elevated_privileges()
    }

    pub fn mount_state(&self, id: &str) -> Option<MountState> {
        self.registry.get(id.trim()).map(|m| m.state())
    }

    pub fn mount_last_error(&self, id: &str) -> Option<String> {
        self.registry.get(id.trim()).and_then(|m| m.last_error())
    }

    pub fn backend_of(&self, id: &str) -> Option<String> {
        self.registry.get(id.trim()).map(|m| m.backend().to_string())
    }

    /// 卸载所有剩余挂载并回收托管线程；可重复调用
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for mount in self.registry.all() {
            if mount.state() == MountState::Mounted {
                let _ = self.try_unmount(mount.id());
            }
        }
        self.reaper.shutdown(self.settings.forced_unmount_timeout());
        tracing::debug!("虚拟盘服务已关闭");
    }
}

fn unexpected(id: &str, path: &str, outcome: Outcome) -> VdError {
    VdError::RegistrationFailed {
        id: id.to_string(),
        reason: format!("分发结果与请求不匹配（{}）: {:?}", path, outcome),
    }
}

impl Drop for VirtualDriveService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::FixedPrivilege;
    use crate::virtual_driver::driver_service::UnsupportedDriver;

    fn service() -> Arc<VirtualDriveService> {
        VirtualDriveService::builder()
            .driver(Arc::new(UnsupportedDriver))
            .privilege_checker(Arc::new(FixedPrivilege(true)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_invalid_identifiers() {
        let svc = service();
        assert_eq!(
            svc.try_mount("   ", "mem"),
            Err(VdError::InvalidIdentifier(String::new()))
        );
        let long = "x".repeat(261);
        assert!(matches!(
            svc.try_mount(&long, "mem"),
            Err(VdError::InvalidIdentifier(_))
        ));
        assert!(svc.get_last_error().contains("挂载标识无效"));
    }

    #[test]
    fn test_unsupported_driver_reports_unavailable() {
        let svc = service();
        assert!(matches!(
            svc.try_mount("Z", "mem"),
            Err(VdError::DriverUnavailable(_))
        ));
        assert!(svc.list_mounts().is_empty());
        assert_eq!(svc.mount_state("Z"), None);
        assert!(!svc.is_mount_in_progress());
    }

    #[test]
    fn test_operations_on_unknown_mount() {
        let svc = service();
        assert!(!svc.unmount("nope"));
        assert_eq!(
            svc.set_handlers("nope", HandlerSet::new()),
            Err(VdError::NotMounted("nope".to_string()))
        );
        assert_eq!(
            svc.sync_read("nope", "/f", 4, 0),
            Err(VdError::NotMounted("nope".to_string()))
        );
        assert!(svc.has_elevated_privileges());
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let mut settings = BridgeSettings::default();
        settings.worker_count = 0;
        assert!(VirtualDriveService::builder()
            .settings(settings)
            .driver(Arc::new(UnsupportedDriver))
            .build()
            .is_err());
    }
}
