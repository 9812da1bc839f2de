//! 驱动子系统接缝（跨平台门面）。
//!
//! - 根据平台导出不同的实现，统一通过 `default_driver()` 获取；
//! - 驱动只和 `DriverAdapter` 打交道，看到的永远是 `FsStatus`。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::VdError;
use crate::settings::BridgeSettings;

use super::adapter::DriverAdapter;

#[cfg(all(feature = "virtual-driver", target_os = "windows"))]
mod windows;

#[cfg(all(
    feature = "virtual-driver",
    any(target_os = "linux", target_os = "macos")
))]
mod fuse;

mod stub;

#[cfg(all(feature = "virtual-driver", target_os = "windows"))]
pub use windows::{normalize_mount_point, DokanDriver};

#[cfg(all(
    feature = "virtual-driver",
    any(target_os = "linux", target_os = "macos")
))]
pub use fuse::{normalize_mount_point, FuseDriver};

pub use stub::UnsupportedDriver;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// 驱动未安装或当前构建不含驱动后端
    #[error("{0}")]
    Unavailable(String),
    /// 驱动拒绝了这次挂载（挂载点被占用、参数错误等）
    #[error("{0}")]
    Rejected(String),
}

impl DriverError {
    pub fn into_vd_error(self, mount_id: &str) -> VdError {
        match self {
            DriverError::Unavailable(msg) => VdError::DriverUnavailable(msg),
            DriverError::Rejected(reason) => VdError::RegistrationFailed {
                id: mount_id.to_string(),
                reason,
            },
        }
    }
}

/// 传给驱动的挂载参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// 挂载点（Windows 盘符 / Unix 目录），由挂载标识而来
    pub mount_point: String,
    pub volume_label: String,
    pub fs_name: String,
    /// 驱动单次请求超时
    pub thread_timeout: Duration,
    pub current_session_only: bool,
    pub case_sensitive: bool,
    pub allocation_unit_size: u32,
    pub sector_size: u32,
}

impl DriverOptions {
    pub fn from_settings(mount_id: &str, settings: &BridgeSettings) -> Self {
        Self {
            mount_point: mount_id.to_string(),
            volume_label: settings.volume.label.clone(),
            fs_name: settings.volume.fs_name.clone(),
            thread_timeout: Duration::from_millis(settings.driver.thread_timeout_ms as u64),
            current_session_only: settings.driver.current_session_only,
            case_sensitive: settings.driver.case_sensitive,
            allocation_unit_size: settings.driver.allocation_unit_size,
            sector_size: settings.driver.sector_size,
        }
    }
}

/// 宿主的文件系统驱动框架
pub trait DriverSubsystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// 注册挂载点并阻塞到挂载点被移除。
    ///
    /// 卷可见后调用一次 `ready()`；在 `ready()` 之前返回 `Err` 视为挂载失败。
    /// 驱动框架从自己的线程回调 `operations`。
    fn register(
        &self,
        mount_id: &str,
        operations: Arc<DriverAdapter>,
        options: &DriverOptions,
        ready: &mut dyn FnMut(),
    ) -> Result<(), DriverError>;

    /// 请求优雅移除；`register` 随后返回
    fn remove_mount_point(&self, mount_id: &str);

    /// 强制移除；返回驱动是否接受了这次强制移除
    fn force_remove_mount_point(&self, mount_id: &str) -> bool;
}

/// 当前构建携带的驱动后端
pub fn default_driver() -> Arc<dyn DriverSubsystem> {
    #[cfg(all(feature = "virtual-driver", target_os = "windows"))]
    {
        Arc::new(DokanDriver::default())
    }
    #[cfg(all(
        feature = "virtual-driver",
        any(target_os = "linux", target_os = "macos")
    ))]
    {
        Arc::new(FuseDriver::default())
    }
    #[cfg(not(all(
        feature = "virtual-driver",
        any(target_os = "windows", target_os = "linux", target_os = "macos")
    )))]
    {
        Arc::new(UnsupportedDriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_mapping() {
        assert_eq!(
            DriverError::Unavailable("no dokan".to_string()).into_vd_error("Z"),
            VdError::DriverUnavailable("no dokan".to_string())
        );
        assert_eq!(
            DriverError::Rejected("busy".to_string()).into_vd_error("Z"),
            VdError::RegistrationFailed {
                id: "Z".to_string(),
                reason: "busy".to_string()
            }
        );
    }

    #[test]
    fn test_options_follow_settings() {
        let mut settings = BridgeSettings::default();
        settings.driver.thread_timeout_ms = 1500;
        settings.volume.label = "Scratch".to_string();
        let options = DriverOptions::from_settings("Q", &settings);
        assert_eq!(options.mount_point, "Q");
        assert_eq!(options.volume_label, "Scratch");
        assert_eq!(options.thread_timeout, Duration::from_millis(1500));
        assert!(options.case_sensitive);
    }
}
