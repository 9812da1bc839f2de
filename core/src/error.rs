//! 错误类型。
//!
//! - `VdError`：面向宿主调用方（mount/unmount/sync_* 等）的错误。
//! - `HandlerError`：回调（handler）自身返回的错误；在分发边界统一转换为 `VdError::HandlerFault`。
//! - 面向驱动框架的代码从不返回这两者，只返回 `FsStatus`（见 `virtual_driver::semantics`）。

use std::time::Duration;

use thiserror::Error;

use crate::handlers::OpKind;

pub type VdResult<T> = Result<T, VdError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VdError {
    /// 挂载标识为空或超过宿主允许的挂载名长度
    #[error("挂载标识无效: {0:?}")]
    InvalidIdentifier(String),

    #[error("虚拟盘已挂载: {0}")]
    DuplicateMount(String),

    #[error("虚拟盘未挂载: {0}")]
    NotMounted(String),

    /// 驱动子系统不可达（未安装驱动、当前构建不含驱动后端等）
    #[error("驱动不可用: {0}")]
    DriverUnavailable(String),

    #[error("挂载确认超时（{id}，{timeout:?}）")]
    RegistrationTimeout { id: String, timeout: Duration },

    #[error("挂载失败（{id}）: {reason}")]
    RegistrationFailed { id: String, reason: String },

    /// 回调执行时返回错误或 panic
    #[error("回调 {op} 执行失败（{path}）: {message}")]
    HandlerFault {
        op: OpKind,
        path: String,
        message: String,
    },

    /// 驱动已摘除，但内部线程在强制卸载后仍未退出
    #[error("卸载超时: {0}")]
    UnmountTimeout(String),

    /// 优雅卸载超时，已走强制卸载（盘已摘除，线程已退出）
    #[error("卸载时使用了强制移除: {0}")]
    UnmountForced(String),

    /// 排队中的请求在完成前被强制卸载丢弃
    #[error("请求在完成前被丢弃: {0}")]
    RequestDropped(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("回调脚本错误: {0}")]
    Script(String),
}

impl VdError {
    pub(crate) fn handler_fault(op: OpKind, path: &str, message: impl Into<String>) -> Self {
        Self::HandlerFault {
            op,
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// 警告类错误：记录到 last-error，但不代表操作失败
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::UnmountForced(_))
    }
}

/// 回调返回的错误（只携带一条消息）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;
