//! QuarkDrive 虚拟盘桥接核心库入口（供 CLI 等 app crate 复用）。
//!
//! 一个挂载的盘符/挂载点完全由调用方注册的回调（read/write/list/exists/size）提供内容，
//! 本 crate 负责挂载生命周期、回调注册表、请求分发以及驱动回调适配。

pub mod error;
pub mod handlers;
pub mod privilege;
pub mod settings;

/// 虚拟盘（Windows Dokan / Linux、macOS FUSE）。
///
/// 注意：真实驱动后端仅在启用 feature `virtual-driver` 时编译；
/// 关闭时 `default_driver()` 返回 `UnsupportedDriver`，其余逻辑（注册表/分发/适配）照常可用。
pub mod virtual_driver;

pub use error::{HandlerError, HandlerResult, VdError, VdResult};
pub use handlers::{FsCallbacks, HandlerSet, OpKind};
pub use settings::BridgeSettings;
pub use virtual_driver::{
    MountState, ReadOutcome, UnmountOutcome, UnmountReport, VirtualDriveService,
};
