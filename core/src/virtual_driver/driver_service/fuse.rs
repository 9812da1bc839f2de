//! Linux/macOS 驱动子系统（FUSE）。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fuser::{spawn_mount2, MountOption};

use super::{DriverError, DriverOptions, DriverSubsystem};
use crate::virtual_driver::adapter::DriverAdapter;
use crate::virtual_driver::fuse::QuarkFuseFs;
use crate::virtual_driver::lock;

struct MountedSession {
    generation: u64,
    mount_path: PathBuf,
    stop: Sender<()>,
}

/// 挂载标识 → 正在运行的 FUSE 会话。每个标识同时只允许一个会话，
/// 移除时核对代号，旧会话退出不会摘掉新会话的登记。
#[derive(Default)]
struct SessionTable {
    next_generation: u64,
    sessions: HashMap<String, MountedSession>,
}

impl SessionTable {
    fn is_occupied(&self, mount_id: &str) -> bool {
        self.sessions.contains_key(mount_id)
    }

    /// 登记新会话；标识已被占用时返回 None
    fn insert(&mut self, mount_id: &str, mount_path: PathBuf, stop: Sender<()>) -> Option<u64> {
        match self.sessions.entry(mount_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                self.next_generation += 1;
                let generation = self.next_generation;
                slot.insert(MountedSession {
                    generation,
                    mount_path,
                    stop,
                });
                Some(generation)
            }
        }
    }

    fn remove(&mut self, mount_id: &str, generation: u64) {
        if self
            .sessions
            .get(mount_id)
            .is_some_and(|s| s.generation == generation)
        {
            self.sessions.remove(mount_id);
        }
    }

    /// 通知会话停止，返回其挂载路径
    fn signal_stop(&self, mount_id: &str) -> Option<PathBuf> {
        let session = self.sessions.get(mount_id)?;
        let _ = session.stop.send(());
        Some(session.mount_path.clone())
    }
}

#[derive(Default)]
pub struct FuseDriver {
    sessions: Mutex<SessionTable>,
}

/// 规范化挂载点：展开 `~/`，相对路径解释为 home 下的路径
pub fn normalize_mount_point(input: &str) -> Result<PathBuf, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("挂载点不能为空".to_string());
    }

    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| "无法获取用户 home 目录".to_string())?;
        return Ok(home.join(rest));
    }

    let p = PathBuf::from(s);
    if p.is_absolute() {
        return Ok(p);
    }

    // 相对路径：避免“当前工作目录不确定”导致找不到
    let home = dirs::home_dir().ok_or_else(|| "无法获取用户 home 目录".to_string())?;
    Ok(home.join(p))
}

/// 卸载挂载点；`force` 时使用懒卸载 / 强制卸载
fn unmount_command(mount_path: &Path, force: bool) -> bool {
    #[cfg(target_os = "linux")]
    let output = Command::new("fusermount3")
        .arg(if force { "-uz" } else { "-u" })
        .arg(mount_path)
        .output();
    #[cfg(target_os = "macos")]
    let output = {
        let mut cmd = Command::new("umount");
        if force {
            cmd.arg("-f");
        }
        cmd.arg(mount_path).output()
    };
    match output {
        Ok(out) => out.status.success(),
        Err(e) => {
            tracing::debug!(path = %mount_path.display(), "执行卸载命令失败: {}", e);
            false
        }
    }
}

/// 确保挂载点是一个可用目录；清理上次残留的挂载
fn prepare_mount_dir(mount_path: &Path) -> Result<(), DriverError> {
    if mount_path.exists() {
        // 不是挂载点时失败，忽略
        let _ = unmount_command(mount_path, false);
    }

    if let Err(e) = std::fs::create_dir_all(mount_path) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(DriverError::Rejected(format!("创建挂载点目录失败: {}", e)));
        }
    }

    if !mount_path.is_dir() {
        let _ = unmount_command(mount_path, true);
        std::thread::sleep(Duration::from_millis(100));
        let _ = std::fs::create_dir_all(mount_path);
        if !mount_path.is_dir() {
            return Err(DriverError::Rejected(format!(
                "挂载点不是目录: {}（可能是残留的挂载点）",
                mount_path.display()
            )));
        }
    }
    Ok(())
}

impl FuseDriver {
    fn signal_stop(&self, mount_id: &str) -> Option<PathBuf> {
        lock(&self.sessions).signal_stop(mount_id)
    }
}

impl DriverSubsystem for FuseDriver {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn register(
        &self,
        mount_id: &str,
        operations: Arc<DriverAdapter>,
        options: &DriverOptions,
        ready: &mut dyn FnMut(),
    ) -> Result<(), DriverError> {
        let mount_path = normalize_mount_point(&options.mount_point).map_err(DriverError::Rejected)?;
        // 残留清理会卸载挂载点上的会话，不能碰到同一标识仍在运行的会话
        if lock(&self.sessions).is_occupied(mount_id) {
            return Err(DriverError::Rejected(format!("挂载标识仍有运行中的 FUSE 会话: {}", mount_id)));
        }
        prepare_mount_dir(&mount_path)?;

        let fs = QuarkFuseFs::new(operations);
        let mount_options = [
            MountOption::FSName(options.volume_label.clone()),
            MountOption::Subtype("quarkdrive".to_string()),
            MountOption::DefaultPermissions,
            // 不使用 AllowOther，避免需要修改 /etc/fuse.conf
        ];

        let session = spawn_mount2(fs, &mount_path, &mount_options).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DriverError::Unavailable(format!("FUSE 不可用（未安装 fuse3？）: {}", e))
            } else {
                DriverError::Rejected(format!("挂载失败: {}", e))
            }
        })?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let inserted = lock(&self.sessions).insert(mount_id, mount_path.clone(), stop_tx);
        let Some(generation) = inserted else {
            // 丢弃 session 即卸载刚挂上的文件系统
            drop(session);
            return Err(DriverError::Rejected(format!("挂载标识仍有运行中的 FUSE 会话: {}", mount_id)));
        };
        tracing::debug!(mount_id, path = %mount_path.display(), "FUSE 挂载点已出现");
        ready();

        // 阻塞到 remove_mount_point / force_remove_mount_point
        let _ = stop_rx.recv();
        lock(&self.sessions).remove(mount_id, generation);

        // 显式 join：确保卸载完成、目录不再 busy
        session.join();
        Ok(())
    }

    fn remove_mount_point(&self, mount_id: &str) {
        if self.signal_stop(mount_id).is_none() {
            tracing::debug!(mount_id, "FUSE 会话不存在（可能已卸载）");
        }
    }

    fn force_remove_mount_point(&self, mount_id: &str) -> bool {
        let Some(mount_path) = self.signal_stop(mount_id) else {
            return false;
        };
        unmount_command(&mount_path, true)
    }
}
