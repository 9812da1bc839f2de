//! 驱动无关的文件系统语义：状态码、读取裁剪、路径换算、文件信息。
//!
//! 面向驱动框架的一侧只见 `FsStatus`；Dokan 映射为 NTSTATUS，FUSE 映射为 errno。

use std::time::SystemTime;

/// 驱动回调结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
    Success,
    NotFound,
    NotADirectory,
    AccessDenied,
    InvalidParameter,
    Failure,
}

impl FsStatus {
    /// FUSE 使用的 errno
    #[cfg(unix)]
    pub fn errno(self) -> i32 {
        match self {
            FsStatus::Success => 0,
            FsStatus::NotFound => libc::ENOENT,
            FsStatus::NotADirectory => libc::ENOTDIR,
            FsStatus::AccessDenied => libc::EACCES,
            FsStatus::InvalidParameter => libc::EINVAL,
            FsStatus::Failure => libc::EIO,
        }
    }

    /// Dokan 使用的 NTSTATUS
    #[cfg(windows)]
    pub fn ntstatus(self) -> i32 {
        use winapi::shared::ntstatus::{
            STATUS_ACCESS_DENIED, STATUS_INVALID_PARAMETER,
            STATUS_NOT_A_DIRECTORY, STATUS_OBJECT_NAME_NOT_FOUND, STATUS_SUCCESS,
            STATUS_UNSUCCESSFUL,
        };
        match self {
            FsStatus::Success => STATUS_SUCCESS,
            FsStatus::NotFound => STATUS_OBJECT_NAME_NOT_FOUND,
            FsStatus::NotADirectory => STATUS_NOT_A_DIRECTORY,
            FsStatus::AccessDenied => STATUS_ACCESS_DENIED,
            FsStatus::InvalidParameter => STATUS_INVALID_PARAMETER,
            FsStatus::Failure => STATUS_UNSUCCESSFUL,
        }
    }
}

/// 一次读取的结果。`end_of_data` 表示偏移已到达或越过数据末尾。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    pub end_of_data: bool,
}

/// 把回调返回的完整内容裁剪到 `[offset, offset + length)`。
///
/// `offset >= data.len()` 时返回空且 `end_of_data = true`；
/// 否则返回 `min(length, data.len() - offset)` 字节。
pub fn clip_read(mut data: Vec<u8>, offset: u64, length: usize) -> ReadOutcome {
    let total = data.len() as u64;
    if offset >= total {
        return ReadOutcome {
            bytes: Vec::new(),
            end_of_data: true,
        };
    }
    let start = offset as usize;
    let end = start.saturating_add(length).min(data.len());
    data.truncate(end);
    data.drain(..start);
    ReadOutcome {
        bytes: data,
        end_of_data: false,
    }
}

/// 驱动路径 -> 回调路径：统一为 `/` 分隔、以 `/` 开头、无尾部分隔符
///
/// `\` -> `/`，`\docs\a.txt` -> `/docs/a.txt`，`` -> `/`
pub fn to_handler_path(raw: &str) -> String {
    let parts: Vec<&str> = raw
        .split(['\\', '/'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub fn is_root(path: &str) -> bool {
    path == "/"
}

pub fn join(dir: &str, name: &str) -> String {
    if is_root(dir) {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// 列表项名字约定：以 `/` 结尾表示子目录
pub fn split_listing_name(name: &str) -> (&str, NodeKind) {
    match name.strip_suffix('/') {
        Some(dir) => (dir, NodeKind::Directory),
        None => (name, NodeKind::File),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// 驱动打开文件时的意图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    /// 只打开已存在的文件/目录
    OpenExisting,
    /// 文件不存在时创建
    CreateFile,
    /// 请求创建目录
    CreateDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInformation {
    pub kind: NodeKind,
    pub size: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

impl FileInformation {
    pub fn now(kind: NodeKind, size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            size,
            created: now,
            accessed: now,
            modified: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: NodeKind,
    /// 取大小失败时为 None（条目仍然保留）
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInformation {
    pub label: String,
    pub fs_name: String,
    pub serial_number: u32,
    pub max_component_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_read() {
        let data = b"hello world".to_vec();
        assert_eq!(clip_read(data.clone(), 0, 5).bytes, b"hello");
        assert_eq!(clip_read(data.clone(), 6, 100).bytes, b"world");

        let past = clip_read(data.clone(), 11, 4);
        assert!(past.bytes.is_empty());
        assert!(past.end_of_data);

        let beyond = clip_read(data.clone(), 500, 4);
        assert!(beyond.end_of_data);

        let zero = clip_read(data, 3, 0);
        assert!(zero.bytes.is_empty());
        assert!(!zero.end_of_data);

        assert!(clip_read(Vec::new(), 0, 10).end_of_data);
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsStatus::Success.errno(), 0);
        assert_eq!(FsStatus::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsStatus::Failure.errno(), libc::EIO);
    }

    #[test]
    fn test_clip_read_huge_length_does_not_overflow() {
        let out = clip_read(b"abc".to_vec(), 1, usize::MAX);
        assert_eq!(out.bytes, b"bc");
    }

    #[test]
    fn test_to_handler_path() {
        assert_eq!(to_handler_path("\\"), "/");
        assert_eq!(to_handler_path(""), "/");
        assert_eq!(to_handler_path("\\docs\\a.txt"), "/docs/a.txt");
        assert_eq!(to_handler_path("/docs/./b/"), "/docs/b");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/docs", "a"), "/docs/a");
    }

    #[test]
    fn test_split_listing_name() {
        assert_eq!(split_listing_name("sub/"), ("sub", NodeKind::Directory));
        assert_eq!(split_listing_name("a.txt"), ("a.txt", NodeKind::File));
    }
}
