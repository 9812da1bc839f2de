//! 驱动回调适配层。
//!
//! 驱动框架（Dokan / FUSE）在自己的线程上调用这里的方法。每次调用：
//! 1. 通过挂载表解析挂载；解析不到直接返回 `FsStatus::Failure`，不碰任何回调；
//! 2. 把驱动路径换算成回调路径；
//! 3. 以直接模式分发；回调错误在这里被记录并收敛为 `FsStatus::Failure`。
//!
//! 这里的公开方法只返回 `FsStatus`，不会把错误或 panic 带回驱动框架。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::handlers::OpKind;
use crate::settings::VolumeSettings;

use super::dispatch::{Operation, Outcome};
use super::mount::Mount;
use super::registry::MountRegistry;
use super::semantics::{
    is_root, join, split_listing_name, to_handler_path, DirEntryInfo, DiskSpace, FileInformation,
    FsStatus, NodeKind, OpenIntent, ReadOutcome, VolumeInformation,
};

pub struct DriverAdapter {
    mount_id: Arc<str>,
    registry: Arc<MountRegistry>,
    volume: VolumeSettings,
}

impl DriverAdapter {
    pub(crate) fn new(mount_id: &str, registry: Arc<MountRegistry>, volume: VolumeSettings) -> Self {
        Self {
            mount_id: Arc::from(mount_id),
            registry,
            volume,
        }
    }

    pub fn mount_id(&self) -> &str {
        &self.mount_id
    }

    fn resolve(&self) -> Result<Arc<Mount>, FsStatus> {
        self.registry.resolve(&self.mount_id).ok_or_else(|| {
            tracing::debug!(mount_id = %self.mount_id, "挂载不可解析，拒绝驱动回调");
            FsStatus::Failure
        })
    }

    fn run(&self, mount: &Mount, op: Operation) -> Result<Outcome, FsStatus> {
        mount.dispatcher().direct(op).map_err(|e| {
            let message = e.to_string();
            tracing::warn!(mount_id = %self.mount_id, "{}", message);
            mount.record_error(&message);
            FsStatus::Failure
        })
    }

    fn handler_set(mount: &Mount, kind: OpKind) -> bool {
        mount.callbacks().snapshot().is_set(kind)
    }

    fn exists(&self, mount: &Mount, path: &str) -> Result<bool, FsStatus> {
        match self.run(
            mount,
            Operation::Exists {
                path: path.to_string(),
            },
        )? {
            Outcome::Exists(b) => Ok(b),
            _ => Err(FsStatus::Failure),
        }
    }

    fn size(&self, mount: &Mount, path: &str) -> Result<u64, FsStatus> {
        match self.run(
            mount,
            Operation::Size {
                path: path.to_string(),
            },
        )? {
            Outcome::Size(n) => Ok(n),
            _ => Err(FsStatus::Failure),
        }
    }

    fn list(&self, mount: &Mount, path: &str) -> Result<Vec<String>, FsStatus> {
        match self.run(
            mount,
            Operation::List {
                path: path.to_string(),
            },
        )? {
            Outcome::Names(names) => Ok(names),
            _ => Err(FsStatus::Failure),
        }
    }

    /// 打开/创建。根目录恒为目录；不支持创建目录。
    ///
    /// 目录判定：List 回调对该路径返回非空。
    pub fn open(&self, raw_path: &str, intent: OpenIntent) -> Result<NodeKind, FsStatus> {
        let mount = self.resolve()?;
        let path = to_handler_path(raw_path);
        tracing::trace!(mount_id = %self.mount_id, path = %path, ?intent, "open");
        if is_root(&path) {
            return Ok(NodeKind::Directory);
        }
        if intent == OpenIntent::CreateDirectory {
            return Err(FsStatus::AccessDenied);
        }
        if Self::handler_set(&mount, OpKind::Exists) && !self.exists(&mount, &path)? {
            return match intent {
                OpenIntent::CreateFile => Ok(NodeKind::File),
                _ => Err(FsStatus::NotFound),
            };
        }
        if Self::handler_set(&mount, OpKind::List) && !self.list(&mount, &path)?.is_empty() {
            return Ok(NodeKind::Directory);
        }
        Ok(NodeKind::File)
    }

    /// 读取 `[offset, offset + length)`；偏移越过末尾返回空结果（end_of_data），不是错误
    pub fn read(&self, raw_path: &str, offset: i64, length: usize) -> Result<ReadOutcome, FsStatus> {
        let mount = self.resolve()?;
        let path = to_handler_path(raw_path);
        tracing::trace!(mount_id = %self.mount_id, path = %path, offset, length, "read");
        let offset = u64::try_from(offset).map_err(|_| FsStatus::InvalidParameter)?;
        match self.run(
            &mount,
            Operation::Read {
                path,
                offset,
                length,
            },
        )? {
            Outcome::Read(out) => Ok(out),
            _ => Err(FsStatus::Failure),
        }
    }

    /// 缓冲区原样交给回调；成功即报告写入了全部字节
    pub fn write(&self, raw_path: &str, data: &[u8]) -> Result<u32, FsStatus> {
        let mount = self.resolve()?;
        let path = to_handler_path(raw_path);
        tracing::trace!(mount_id = %self.mount_id, path = %path, len = data.len(), "write");
        match self.run(
            &mount,
            Operation::Write {
                path,
                data: data.to_vec(),
            },
        )? {
            Outcome::Written(n) => u32::try_from(n).map_err(|_| FsStatus::InvalidParameter),
            _ => Err(FsStatus::Failure),
        }
    }

    /// 目录枚举：保持回调给出的顺序；单个条目取大小失败只记为“大小未知”
    pub fn find_files(&self, raw_path: &str) -> Result<Vec<DirEntryInfo>, FsStatus> {
        let mount = self.resolve()?;
        let dir = to_handler_path(raw_path);
        tracing::trace!(mount_id = %self.mount_id, path = %dir, "find_files");
        let names = self.list(&mount, &dir)?;
        let with_size = Self::handler_set(&mount, OpKind::Size);

        let mut entries = Vec::with_capacity(names.len());
        for raw in &names {
            let (name, kind) = split_listing_name(raw);
            if name.is_empty() {
                continue;
            }
            let size = match kind {
                NodeKind::Directory => Some(0),
                NodeKind::File if with_size => self.size(&mount, &join(&dir, name)).ok(),
                NodeKind::File => Some(0),
            };
            entries.push(DirEntryInfo {
                name: name.to_string(),
                kind,
                size,
            });
        }
        Ok(entries)
    }

    /// 元数据。`hint` 为打开时判定的类型。
    ///
    /// 文件：设置了 Exists 且返回 false 时为 NotFound；否则合成普通文件属性，
    /// 时间戳取当前时间，大小来自 Size 回调（未设置时为 0）。
    pub fn file_information(&self, raw_path: &str, hint: NodeKind) -> Result<FileInformation, FsStatus> {
        let mount = self.resolve()?;
        let path = to_handler_path(raw_path);
        tracing::trace!(mount_id = %self.mount_id, path = %path, "file_information");
        if is_root(&path) || hint == NodeKind::Directory {
            return Ok(FileInformation::now(NodeKind::Directory, 0));
        }
        if Self::handler_set(&mount, OpKind::Exists) && !self.exists(&mount, &path)? {
            return Err(FsStatus::NotFound);
        }
        let size = if Self::handler_set(&mount, OpKind::Size) {
            self.size(&mount, &path)?
        } else {
            0
        };
        Ok(FileInformation::now(NodeKind::File, size))
    }

    pub fn volume_information(&self) -> VolumeInformation {
        VolumeInformation {
            label: self.volume.label.clone(),
            fs_name: self.volume.fs_name.clone(),
            serial_number: self.volume.serial_number,
            max_component_length: self.volume.max_component_length,
        }
    }

    pub fn disk_free_space(&self) -> DiskSpace {
        let free = self.volume.free_bytes.min(self.volume.total_bytes);
        DiskSpace {
            total_bytes: self.volume.total_bytes,
            free_bytes: free,
            available_bytes: free,
        }
    }

    pub fn cleanup(&self, raw_path: &str) {
        tracing::trace!(mount_id = %self.mount_id, path = raw_path, "cleanup");
    }

    pub fn close(&self, raw_path: &str) {
        tracing::trace!(mount_id = %self.mount_id, path = raw_path, "close");
    }

    /// 平台回调的最外层：适配层自身的 panic 也不能穿过驱动框架的栈帧
    pub fn contain<T>(&self, what: &str, f: impl FnOnce() -> Result<T, FsStatus>) -> Result<T, FsStatus> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(_) => {
                let message = format!("驱动回调 {} 发生 panic（{}）", what, self.mount_id);
                tracing::error!(mount_id = %self.mount_id, "{}", message);
                if let Some(mount) = self.registry.get(&self.mount_id) {
                    mount.record_error(&message);
                }
                Err(FsStatus::Failure)
            }
        }
    }
}
