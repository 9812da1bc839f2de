//! 进程内存回调：CLI `--backend memory` 与测试使用。
//!
//! 只在进程存活期间保存内容，不做任何持久化。

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{HandlerError, HandlerResult};

use super::FsCallbacks;

#[derive(Debug, Default)]
pub struct MemoryHandlers {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut files) = self.files.write() {
            files.insert(normalize(path), data.into());
        }
        self
    }

    pub fn file_count(&self) -> usize {
        self.files.read().map(|f| f.len()).unwrap_or(0)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

/// 目录前缀：`/` -> `/`，`/a` -> `/a/`
fn dir_prefix(path: &str) -> String {
    let p = normalize(path);
    if p == "/" {
        p
    } else {
        format!("{}/", p)
    }
}

impl FsCallbacks for MemoryHandlers {
    fn read(&self, path: &str) -> HandlerResult<Vec<u8>> {
        let files = self
            .files
            .read()
            .map_err(|_| HandlerError::new("memory store lock poisoned"))?;
        files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| HandlerError::new(format!("文件不存在: {}", path)))
    }

    fn write(&self, path: &str, data: &[u8]) -> HandlerResult<()> {
        let mut files = self
            .files
            .write()
            .map_err(|_| HandlerError::new("memory store lock poisoned"))?;
        files.insert(normalize(path), data.to_vec());
        Ok(())
    }

    /// 直接子项；子目录以 `/` 结尾，按名字排序
    fn list(&self, path: &str) -> HandlerResult<Vec<String>> {
        let files = self
            .files
            .read()
            .map_err(|_| HandlerError::new("memory store lock poisoned"))?;
        let prefix = dir_prefix(path);
        let mut names: Vec<String> = Vec::new();
        for key in files.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let name = match rest.split_once('/') {
                Some((dir, _)) => format!("{}/", dir),
                None => rest.to_string(),
            };
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn exists(&self, path: &str) -> HandlerResult<bool> {
        let files = self
            .files
            .read()
            .map_err(|_| HandlerError::new("memory store lock poisoned"))?;
        let p = normalize(path);
        if p == "/" || files.contains_key(&p) {
            return Ok(true);
        }
        let prefix = dir_prefix(path);
        Ok(files.keys().any(|k| k.starts_with(&prefix)))
    }

    fn size(&self, path: &str) -> HandlerResult<u64> {
        let files = self
            .files
            .read()
            .map_err(|_| HandlerError::new("memory store lock poisoned"))?;
        files
            .get(&normalize(path))
            .map(|d| d.len() as u64)
            .ok_or_else(|| HandlerError::new(format!("文件不存在: {}", path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_direct_children() {
        let store = MemoryHandlers::new()
            .with_file("/a.txt", "a")
            .with_file("/docs/b.txt", "bb")
            .with_file("/docs/deep/c.txt", "ccc")
            .with_file("/docs/e.txt", "e");

        assert_eq!(
            FsCallbacks::list(&store, "/").unwrap(),
            vec!["a.txt".to_string(), "docs/".to_string()]
        );
        assert_eq!(
            FsCallbacks::list(&store, "/docs").unwrap(),
            vec!["b.txt".to_string(), "deep/".to_string(), "e.txt".to_string()]
        );
    }

    #[test]
    fn test_read_write_exists_size() {
        let store = MemoryHandlers::new();
        FsCallbacks::write(&store, "notes/today.md", b"hello").unwrap();

        assert_eq!(FsCallbacks::read(&store, "/notes/today.md").unwrap(), b"hello");
        assert_eq!(FsCallbacks::size(&store, "/notes/today.md").unwrap(), 5);
        assert!(FsCallbacks::exists(&store, "/notes").unwrap());
        assert!(!FsCallbacks::exists(&store, "/missing").unwrap());
        assert!(FsCallbacks::read(&store, "/missing").is_err());
        assert_eq!(store.file_count(), 1);
    }
}
