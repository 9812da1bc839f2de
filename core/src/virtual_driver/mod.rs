//! 虚拟盘请求桥接（跨平台门面）。
//!
//! 数据流：驱动子系统 → `DriverAdapter` → `MountRegistry`（解析挂载）→ `Dispatcher` → `CallbackRegistry`（调用回调），
//! 结果沿原路返回给驱动线程，或返回给 `sync_*` 的宿主调用方。
//!
//! - 具体驱动后端放在子模块中：Windows 使用 Dokan；Linux/macOS 使用 FUSE；其他构建只有 `UnsupportedDriver`。

mod adapter;
mod callbacks;
mod dispatch;
pub mod driver_service;
mod gate;
mod last_error;
mod mount;
mod registry;
mod semantics;
mod service;
mod supervisor;

#[cfg(all(
    feature = "virtual-driver",
    any(target_os = "linux", target_os = "macos")
))]
mod fuse;
#[cfg(all(feature = "virtual-driver", target_os = "windows"))]
mod windows;

use std::sync::{Mutex, MutexGuard};

pub use adapter::DriverAdapter;
pub use callbacks::CallbackRegistry;
pub use dispatch::{Operation, Outcome};
pub use driver_service::{default_driver, DriverError, DriverOptions, DriverSubsystem};
pub use gate::{ExclusiveGate, ExecutionGate, FreeThreaded, GateGuard};
pub use last_error::ErrorSlot;
pub use mount::MountState;
pub use semantics::{
    clip_read, to_handler_path, DirEntryInfo, DiskSpace, FileInformation, FsStatus, NodeKind,
    OpenIntent, ReadOutcome, VolumeInformation,
};
pub use service::{UnmountOutcome, UnmountReport, VirtualDriveService, VirtualDriveServiceBuilder};

/// 锁被 panic 毒化时直接取回：桥接内部的锁只保护简单状态，不存在“改了一半”的数据
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
