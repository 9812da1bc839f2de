//! 回调（handler）接口：五个固定操作 Read / Write / List / Exists / Size。
//!
//! - 每个操作一个单方法 trait，闭包自动实现，方便只替换部分槽位；
//! - `FsCallbacks` 把五个操作合在一起，未覆写的方法即为“未设置回调”时的默认行为；
//! - `HandlerSet` 是一次 `set_handlers` 的载体：`None` 表示“不修改该槽位”，而不是删除。
//!
//! 路径统一为 `/` 分隔、以 `/` 开头的字符串（驱动侧路径已在适配层规范化）。

mod memory;
mod script;

pub use memory::MemoryHandlers;
pub use script::ScriptHandlers;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::HandlerResult;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpKind {
    Read,
    Write,
    List,
    Exists,
    Size,
}

impl OpKind {
    pub const ALL: [OpKind; 5] = [
        OpKind::Read,
        OpKind::Write,
        OpKind::List,
        OpKind::Exists,
        OpKind::Size,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::List => "list",
            OpKind::Exists => "exists",
            OpKind::Size => "size",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait ReadHandler: Send + Sync {
    fn read(&self, path: &str) -> HandlerResult<Vec<u8>>;
}

pub trait WriteHandler: Send + Sync {
    fn write(&self, path: &str, data: &[u8]) -> HandlerResult<()>;
}

pub trait ListHandler: Send + Sync {
    /// 返回目录下的名字；以 `/` 结尾的名字表示子目录。顺序原样保留。
    fn list(&self, path: &str) -> HandlerResult<Vec<String>>;
}

pub trait ExistsHandler: Send + Sync {
    fn exists(&self, path: &str) -> HandlerResult<bool>;
}

pub trait SizeHandler: Send + Sync {
    fn size(&self, path: &str) -> HandlerResult<u64>;
}

impl<F> ReadHandler for F
where
    F: Fn(&str) -> HandlerResult<Vec<u8>> + Send + Sync,
{
    fn read(&self, path: &str) -> HandlerResult<Vec<u8>> {
        self(path)
    }
}

impl<F> WriteHandler for F
where
    F: Fn(&str, &[u8]) -> HandlerResult<()> + Send + Sync,
{
    fn write(&self, path: &str, data: &[u8]) -> HandlerResult<()> {
        self(path, data)
    }
}

impl<F> ListHandler for F
where
    F: Fn(&str) -> HandlerResult<Vec<String>> + Send + Sync,
{
    fn list(&self, path: &str) -> HandlerResult<Vec<String>> {
        self(path)
    }
}

impl<F> ExistsHandler for F
where
    F: Fn(&str) -> HandlerResult<bool> + Send + Sync,
{
    fn exists(&self, path: &str) -> HandlerResult<bool> {
        self(path)
    }
}

impl<F> SizeHandler for F
where
    F: Fn(&str) -> HandlerResult<u64> + Send + Sync,
{
    fn size(&self, path: &str) -> HandlerResult<u64> {
        self(path)
    }
}

/// 五个操作合一的回调接口。
///
/// 默认实现即“未设置回调”的行为：
/// Read → 空缓冲；Write → 什么都不存；List → 空；Exists → false；Size → 0。
pub trait FsCallbacks: Send + Sync {
    fn read(&self, _path: &str) -> HandlerResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write(&self, _path: &str, _data: &[u8]) -> HandlerResult<()> {
        Ok(())
    }

    fn list(&self, _path: &str) -> HandlerResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn exists(&self, _path: &str) -> HandlerResult<bool> {
        Ok(false)
    }

    fn size(&self, _path: &str) -> HandlerResult<u64> {
        Ok(0)
    }
}

/// 一组回调槽位。`None` = 不修改。
#[derive(Clone, Default)]
pub struct HandlerSet {
    pub read: Option<Arc<dyn ReadHandler>>,
    pub write: Option<Arc<dyn WriteHandler>>,
    pub list: Option<Arc<dyn ListHandler>>,
    pub exists: Option<Arc<dyn ExistsHandler>>,
    pub size: Option<Arc<dyn SizeHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用一个 `FsCallbacks` 填满全部五个槽位
    pub fn from_callbacks<C>(callbacks: Arc<C>) -> Self
    where
        C: FsCallbacks + 'static,
    {
        let read = Arc::clone(&callbacks);
        let write = Arc::clone(&callbacks);
        let list = Arc::clone(&callbacks);
        let exists = Arc::clone(&callbacks);
        let size = callbacks;
        Self::new()
            .with_read(move |p: &str| FsCallbacks::read(&*read, p))
            .with_write(move |p: &str, d: &[u8]| FsCallbacks::write(&*write, p, d))
            .with_list(move |p: &str| FsCallbacks::list(&*list, p))
            .with_exists(move |p: &str| FsCallbacks::exists(&*exists, p))
            .with_size(move |p: &str| FsCallbacks::size(&*size, p))
    }

    pub fn with_read(mut self, handler: impl ReadHandler + 'static) -> Self {
        self.read = Some(Arc::new(handler));
        self
    }

    pub fn with_write(mut self, handler: impl WriteHandler + 'static) -> Self {
        self.write = Some(Arc::new(handler));
        self
    }

    pub fn with_list(mut self, handler: impl ListHandler + 'static) -> Self {
        self.list = Some(Arc::new(handler));
        self
    }

    pub fn with_exists(mut self, handler: impl ExistsHandler + 'static) -> Self {
        self.exists = Some(Arc::new(handler));
        self
    }

    pub fn with_size(mut self, handler: impl SizeHandler + 'static) -> Self {
        self.size = Some(Arc::new(handler));
        self
    }

    pub fn is_set(&self, kind: OpKind) -> bool {
        match kind {
            OpKind::Read => self.read.is_some(),
            OpKind::Write => self.write.is_some(),
            OpKind::List => self.list.is_some(),
            OpKind::Exists => self.exists.is_some(),
            OpKind::Size => self.size.is_some(),
        }
    }

    pub fn installed(&self) -> Vec<OpKind> {
        OpKind::ALL
            .into_iter()
            .filter(|k| self.is_set(*k))
            .collect()
    }

    /// 以 `base` 为底，用 `self` 中已设置的槽位覆盖
    pub fn merged_over(&self, base: &HandlerSet) -> HandlerSet {
        HandlerSet {
            read: self.read.clone().or_else(|| base.read.clone()),
            write: self.write.clone().or_else(|| base.write.clone()),
            list: self.list.clone().or_else(|| base.list.clone()),
            exists: self.exists.clone().or_else(|| base.exists.clone()),
            size: self.size.clone().or_else(|| base.size.clone()),
        }
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("installed", &self.installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unset_slots() {
        let base = HandlerSet::new()
            .with_read(|_: &str| -> HandlerResult<Vec<u8>> { Ok(b"old".to_vec()) })
            .with_size(|_: &str| -> HandlerResult<u64> { Ok(3) });
        let update = HandlerSet::new().with_read(|_: &str| -> HandlerResult<Vec<u8>> { Ok(b"new".to_vec()) });

        let merged = update.merged_over(&base);
        assert_eq!(merged.installed(), vec![OpKind::Read, OpKind::Size]);
        let read = merged.read.as_ref().map(|h| h.read("/x"));
        assert_eq!(read, Some(Ok(b"new".to_vec())));
        assert_eq!(merged.size.as_ref().map(|h| h.size("/x")), Some(Ok(3)));
    }

    #[test]
    fn test_from_callbacks_uses_trait_defaults() {
        struct OnlyRead;
        impl FsCallbacks for OnlyRead {
            fn read(&self, path: &str) -> HandlerResult<Vec<u8>> {
                Ok(path.as_bytes().to_vec())
            }
        }

        let set = HandlerSet::from_callbacks(Arc::new(OnlyRead));
        assert_eq!(set.installed().len(), 5);
        assert_eq!(set.read.as_ref().map(|h| h.read("/a")), Some(Ok(b"/a".to_vec())));
        assert_eq!(set.exists.as_ref().map(|h| h.exists("/a")), Some(Ok(false)));
        assert_eq!(set.list.as_ref().map(|h| h.list("/")), Some(Ok(Vec::new())));
    }
}
