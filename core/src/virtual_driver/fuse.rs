//! FUSE 文件系统（fuser crate）：把内核请求转给 `DriverAdapter`，状态码映射为 errno。
//!
//! - 与 Dokan 版本共用适配层语义；
//! - inode 与回调路径双向映射，根目录固定为 1；
//! - 不支持 mkdir / rmdir / unlink / rename。

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};

use super::adapter::DriverAdapter;
use super::lock;
use super::semantics::{join, FileInformation, FsStatus, NodeKind, OpenIntent};

const ROOT_INODE: u64 = 1;
const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

#[derive(Default)]
struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

pub(crate) struct QuarkFuseFs {
    adapter: Arc<DriverAdapter>,
    inodes: Mutex<InodeTable>,
    next_fh: AtomicU64,
}

impl QuarkFuseFs {
    pub(crate) fn new(adapter: Arc<DriverAdapter>) -> Self {
        let mut table = InodeTable {
            next: ROOT_INODE + 1,
            ..Default::default()
        };
        table.by_ino.insert(ROOT_INODE, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            adapter,
            inodes: Mutex::new(table),
            next_fh: AtomicU64::new(1),
        }
    }

    fn inode_for(&self, path: &str) -> u64 {
        let mut table = lock(&self.inodes);
        if let Some(&ino) = table.by_path.get(path) {
            return ino;
        }
        let ino = table.next;
        table.next += 1;
        table.by_path.insert(path.to_string(), ino);
        table.by_ino.insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Result<String, FsStatus> {
        lock(&self.inodes)
            .by_ino
            .get(&ino)
            .cloned()
            .ok_or(FsStatus::NotFound)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, FsStatus> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(FsStatus::InvalidParameter)?;
        Ok(join(&parent, name))
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// 打开（判定类型）并取元数据
    fn stat(&self, path: &str) -> Result<FileAttr, FsStatus> {
        let kind = self.adapter.open(path, OpenIntent::OpenExisting)?;
        let info = self.adapter.file_information(path, kind)?;
        Ok(to_attr(self.inode_for(path), &info))
    }
}

fn to_attr(ino: u64, info: &FileInformation) -> FileAttr {
    let (kind, perm) = match info.kind {
        NodeKind::Directory => (FileType::Directory, 0o755),
        NodeKind::File => (FileType::RegularFile, 0o644),
    };
    FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(BLOCK_SIZE as u64),
        atime: info.accessed,
        mtime: info.modified,
        ctime: info.modified,
        crtime: info.created,
        kind,
        perm,
        nlink: 1,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE,
    }
}

impl Filesystem for QuarkFuseFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        tracing::debug!(mount_id = self.adapter.mount_id(), "FUSE 会话已初始化");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.adapter.contain("lookup", || {
            let path = self.child_path(parent, name)?;
            self.stat(&path)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = self.adapter.contain("getattr", || {
            let path = self.path_of(ino)?;
            self.stat(&path)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(status) => reply.error(status.errno()),
        }
    }

    /// 只接受截断（O_TRUNC）等无害请求，原样返回当前属性
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.getattr(_req, ino, None, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.adapter.contain("readdir", || {
            let path = self.path_of(ino)?;
            let entries = self.adapter.find_files(&path)?;

            let parent_ino = match path.rsplit_once('/') {
                Some(("", _)) | None => ROOT_INODE,
                Some((parent, _)) => self.inode_for(parent),
            };
            let mut all: Vec<(u64, FileType, String)> = vec![
                (ino, FileType::Directory, ".".to_string()),
                (parent_ino, FileType::Directory, "..".to_string()),
            ];
            // 保持回调给出的顺序
            for entry in entries {
                let kind = match entry.kind {
                    NodeKind::Directory => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                };
                let child_ino = self.inode_for(&join(&path, &entry.name));
                all.push((child_ino, kind, entry.name));
            }
            Ok(all)
        });

        let all = match result {
            Ok(all) => all,
            Err(status) => {
                reply.error(status.errno());
                return;
            }
        };
        let start = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in all.iter().enumerate().skip(start) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_of(ino) {
            Ok(_) => reply.opened(self.alloc_fh(), 0),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.adapter.contain("read", || {
            let path = self.path_of(ino)?;
            self.adapter.read(&path, offset, size as usize)
        });
        match result {
            // 越过末尾时返回空数据，不是错误
            Ok(out) => reply.data(&out.bytes),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.adapter.contain("write", || {
            let path = self.path_of(ino)?;
            self.adapter.write(&path, data)
        });
        match result {
            Ok(n) => reply.written(n),
            Err(status) => reply.error(status.errno()),
        }
    }

    /// 新文件先以空内容写入，保证随后的 lookup/getattr 能看到它
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.adapter.contain("create", || {
            let path = self.child_path(parent, name)?;
            self.adapter.open(&path, OpenIntent::CreateFile)?;
            self.adapter.write(&path, &[])?;
            let info = FileInformation::now(NodeKind::File, 0);
            Ok(to_attr(self.inode_for(&path), &info))
        });
        match result {
            Ok(attr) => reply.created(&TTL, &attr, 0, self.alloc_fh(), 0),
            Err(status) => reply.error(status.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(FsStatus::AccessDenied.errno());
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Ok(path) = self.path_of(ino) {
            let _ = self.adapter.contain("release", || {
                self.adapter.close(&path);
                Ok(())
            });
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let space = self.adapter.disk_free_space();
        let volume = self.adapter.volume_information();
        let bsize = BLOCK_SIZE as u64;
        reply.statfs(
            space.total_bytes / bsize,
            space.free_bytes / bsize,
            space.available_bytes / bsize,
            0,
            0,
            BLOCK_SIZE,
            volume.max_component_length,
            BLOCK_SIZE,
        );
    }
}
