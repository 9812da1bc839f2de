//! Windows 驱动子系统（Dokan）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dokan::{FileSystemMounter, MountFlags, MountOptions};
use widestring::U16CString;

use super::{DriverError, DriverOptions, DriverSubsystem};
use crate::virtual_driver::adapter::DriverAdapter;
use crate::virtual_driver::lock;
use crate::virtual_driver::windows::{dokan_init_once, QuarkDokanFs};

/// 挂载标识 → 规范化后的挂载点
#[derive(Default)]
pub struct DokanDriver {
    mounted: Mutex<HashMap<String, String>>,
}

impl DokanDriver {
    fn unmount_point(&self, mount_id: &str) -> bool {
        let Some(mount_point) = lock(&self.mounted).get(mount_id).cloned() else {
            return false;
        };
        match U16CString::from_str(&mount_point) {
            Ok(mp) => dokan::unmount(mp.as_ucstr()),
            Err(_) => false,
        }
    }
}

impl DriverSubsystem for DokanDriver {
    fn name(&self) -> &'static str {
        "dokan"
    }

    fn register(
        &self,
        mount_id: &str,
        operations: Arc<DriverAdapter>,
        options: &DriverOptions,
        ready: &mut dyn FnMut(),
    ) -> Result<(), DriverError> {
        dokan_init_once();

        let mount_point = normalize_mount_point(&options.mount_point).map_err(DriverError::Rejected)?;
        let mount_point_u16 = U16CString::from_str(&mount_point)
            .map_err(|_| DriverError::Rejected("mount_point 编码失败".to_string()))?;

        let handler = QuarkDokanFs::new(operations);

        let mut flags = MountFlags::empty();
        if options.current_session_only {
            // 仅当前用户会话可见；部分 Win10 环境下可降低“必须管理员才能挂载盘符”的概率
            flags |= MountFlags::CURRENT_SESSION;
        }
        if options.case_sensitive {
            flags |= MountFlags::CASE_SENSITIVE;
        }
        let mount_options = MountOptions {
            single_thread: false,
            flags,
            unc_name: None,
            timeout: options.thread_timeout,
            allocation_unit_size: options.allocation_unit_size,
            sector_size: options.sector_size,
            volume_security_descriptor: None,
        };

        let mut mounter = FileSystemMounter::new(&handler, mount_point_u16.as_ucstr(), &mount_options);
        let fs = mounter.mount().map_err(|e| classify_mount_error(&e.to_string()))?;

        lock(&self.mounted).insert(mount_id.to_string(), mount_point.clone());
        tracing::debug!(mount_id, mount_point = %mount_point, "Dokan 挂载点已出现");
        ready();

        // drop 阻塞到挂载点被移除
        drop(fs);
        lock(&self.mounted).remove(mount_id);
        Ok(())
    }

    fn remove_mount_point(&self, mount_id: &str) {
        if !self.unmount_point(mount_id) {
            tracing::debug!(mount_id, "Dokan unmount 未生效（可能已卸载）");
        }
    }

    fn force_remove_mount_point(&self, mount_id: &str) -> bool {
        // Dokan 没有单独的强制接口：再次请求移除
        self.unmount_point(mount_id)
    }
}

/// Dokan 报错信息 → 驱动错误（驱动未安装/版本不兼容视为不可用）
fn classify_mount_error(msg: &str) -> DriverError {
    if msg.contains("can't install driver") {
        DriverError::Unavailable(
            "挂载失败：Dokan 驱动不可用（can't install driver）。\n\n请安装 Dokan 2.x Runtime/Driver（仅放置 dokan2.dll 不够，还需要内核驱动 dokan2.sys），安装后建议重启系统。"
                .to_string(),
        )
    } else if msg.contains("requested an incompatible version") {
        DriverError::Unavailable(
            "挂载失败：Dokan 版本不兼容（requested an incompatible version）。\n\n请确保安装的 Dokan Driver 版本与内置 dokan2.dll 匹配，然后重启再试。"
                .to_string(),
        )
    } else {
        DriverError::Rejected(format!("挂载失败: {}", msg))
    }
}

/// 规范化挂载点：`K` / `K:` -> `K:\`
pub fn normalize_mount_point(input: &str) -> Result<String, String> {
    let s = input.trim();
    let mut chars = s.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (None, _, _) => Err("mount_point 不能为空".to_string()),
        (Some(c), None, _) if c.is_ascii_alphabetic() => {
            Ok(format!("{}:\\", c.to_ascii_uppercase()))
        }
        (Some(c), Some(':'), None) if c.is_ascii_alphabetic() => {
            Ok(format!("{}:\\", c.to_ascii_uppercase()))
        }
        _ => Ok(s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mount_point() {
        assert_eq!(normalize_mount_point("k").unwrap(), "K:\\");
        assert_eq!(normalize_mount_point(" Z: ").unwrap(), "Z:\\");
        assert_eq!(normalize_mount_point("C:\\mnt\\q").unwrap(), "C:\\mnt\\q");
        assert!(normalize_mount_point("").is_err());
    }

    #[test]
    fn test_classify_mount_error() {
        assert!(matches!(
            classify_mount_error("os error: can't install driver"),
            DriverError::Unavailable(_)
        ));
        assert!(matches!(
            classify_mount_error("mount point is busy"),
            DriverError::Rejected(_)
        ));
    }
}
