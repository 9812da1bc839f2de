//! Dokan `FileSystemHandler`：把 Dokan 回调转给 `DriverAdapter`，状态码映射为 NTSTATUS。
//!
//! 不支持删除、重命名、创建目录；这些请求一律拒绝。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Once};

use dokan::{
    CreateFileInfo, DiskSpaceInfo, FileInfo, FileSystemHandler, OperationInfo, OperationResult,
    VolumeInfo,
};
use widestring::{U16CStr, U16CString};
use winapi::{
    shared::ntstatus::{STATUS_ACCESS_DENIED, STATUS_INVALID_PARAMETER, STATUS_NOT_A_DIRECTORY},
    um::winnt::{
        FILE_ATTRIBUTE_ARCHIVE, FILE_ATTRIBUTE_DIRECTORY, FILE_CASE_PRESERVED_NAMES,
        FILE_UNICODE_ON_DISK,
    },
};

use super::adapter::DriverAdapter;
use super::semantics::{FsStatus, NodeKind, OpenIntent};

static DOKAN_INIT: Once = Once::new();

pub(crate) fn dokan_init_once() {
    DOKAN_INIT.call_once(|| dokan::init());
}

/// CreateOptions: FILE_DIRECTORY_FILE
const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;
/// CreationDisposition（用户态）
const OPEN_EXISTING: u32 = 3;
const TRUNCATE_EXISTING: u32 = 5;

fn nt<T>(result: Result<T, FsStatus>) -> OperationResult<T> {
    result.map_err(FsStatus::ntstatus)
}

fn file_index(path: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

/// 每个打开句柄的上下文
pub(crate) struct OpenNode {
    path: String,
    kind: NodeKind,
}

pub(crate) struct QuarkDokanFs {
    adapter: Arc<DriverAdapter>,
}

impl QuarkDokanFs {
    pub(crate) fn new(adapter: Arc<DriverAdapter>) -> Self {
        Self { adapter }
    }
}

impl<'c, 'h: 'c> FileSystemHandler<'c, 'h> for QuarkDokanFs {
    type Context = OpenNode;

    fn create_file(
        &'h self,
        file_name: &U16CStr,
        _security_context: &dokan::IO_SECURITY_CONTEXT,
        desired_access: winapi::um::winnt::ACCESS_MASK,
        file_attributes: u32,
        _share_access: u32,
        create_disposition: u32,
        create_options: u32,
        _info: &mut OperationInfo<'c, 'h, Self>,
    ) -> OperationResult<CreateFileInfo<Self::Context>> {
        let user_flags = dokan::map_kernel_to_user_create_file_flags(
            desired_access,
            file_attributes,
            create_options,
            create_disposition,
        );
        let path = file_name.to_string_lossy();
        let wants_dir = (create_options & FILE_DIRECTORY_FILE) != 0
            || (file_attributes & FILE_ATTRIBUTE_DIRECTORY) != 0;
        let opens_existing = matches!(
            user_flags.creation_disposition,
            OPEN_EXISTING | TRUNCATE_EXISTING
        );
        let intent = match (opens_existing, wants_dir) {
            (true, _) => OpenIntent::OpenExisting,
            (false, true) => OpenIntent::CreateDirectory,
            (false, false) => OpenIntent::CreateFile,
        };

        nt(self.adapter.contain("create_file", || {
            let kind = self.adapter.open(&path, intent)?;
            if wants_dir && kind == NodeKind::File {
                return Err(FsStatus::NotADirectory);
            }
            Ok(CreateFileInfo {
                context: OpenNode {
                    path: path.clone(),
                    kind,
                },
                is_dir: kind == NodeKind::Directory,
                new_file_created: false,
            })
        }))
    }

    fn cleanup(
        &'h self,
        file_name: &U16CStr,
        _info: &OperationInfo<'c, 'h, Self>,
        _context: &'c Self::Context,
    ) {
        let path = file_name.to_string_lossy();
        let _ = self.adapter.contain("cleanup", || {
            self.adapter.cleanup(&path);
            Ok(())
        });
    }

    fn close_file(
        &'h self,
        file_name: &U16CStr,
        _info: &OperationInfo<'c, 'h, Self>,
        _context: &'c Self::Context,
    ) {
        let path = file_name.to_string_lossy();
        let _ = self.adapter.contain("close_file", || {
            self.adapter.close(&path);
            Ok(())
        });
    }

    fn read_file(
        &'h self,
        _file_name: &U16CStr,
        offset: i64,
        buffer: &mut [u8],
        _info: &OperationInfo<'c, 'h, Self>,
        context: &'c Self::Context,
    ) -> OperationResult<u32> {
        if context.kind == NodeKind::Directory {
            return Err(STATUS_INVALID_PARAMETER);
        }
        nt(self.adapter.contain("read_file", || {
            let out = self.adapter.read(&context.path, offset, buffer.len())?;
            // 越过末尾：0 字节，不报错
            let n = out.bytes.len().min(buffer.len());
            buffer[..n].copy_from_slice(&out.bytes[..n]);
            Ok(n as u32)
        }))
    }

    fn write_file(
        &'h self,
        _file_name: &U16CStr,
        _offset: i64,
        buffer: &[u8],
        _info: &OperationInfo<'c, 'h, Self>,
        context: &'c Self::Context,
    ) -> OperationResult<u32> {
        if context.kind == NodeKind::Directory {
            return Err(STATUS_ACCESS_DENIED);
        }
        nt(self
            .adapter
            .contain("write_file", || self.adapter.write(&context.path, buffer)))
    }

    fn get_file_information(
        &'h self,
        _file_name: &U16CStr,
        _info: &OperationInfo<'c, 'h, Self>,
        context: &'c Self::Context,
    ) -> OperationResult<FileInfo> {
        nt(self.adapter.contain("get_file_information", || {
            let meta = self.adapter.file_information(&context.path, context.kind)?;
            let attributes = match meta.kind {
                NodeKind::Directory => FILE_ATTRIBUTE_DIRECTORY,
                NodeKind::File => FILE_ATTRIBUTE_ARCHIVE,
            };
            Ok(FileInfo {
                attributes,
                creation_time: meta.created,
                last_access_time: meta.accessed,
                last_write_time: meta.modified,
                file_size: meta.size,
                number_of_links: 1,
                file_index: file_index(&context.path),
            })
        }))
    }

    fn find_files(
        &'h self,
        _file_name: &U16CStr,
        mut fill_find_data: impl FnMut(&dokan::FindData) -> dokan::FillDataResult,
        _info: &OperationInfo<'c, 'h, Self>,
        context: &'c Self::Context,
    ) -> OperationResult<()> {
        if context.kind == NodeKind::File {
            return Err(STATUS_NOT_A_DIRECTORY);
        }
        let entries = nt(self
            .adapter
            .contain("find_files", || self.adapter.find_files(&context.path)))?;
        for entry in entries {
            let Ok(file_name) = U16CString::from_str(&entry.name) else {
                tracing::debug!(name = %entry.name, "文件名含 NUL，跳过");
                continue;
            };
            let attributes = match entry.kind {
                NodeKind::Directory => FILE_ATTRIBUTE_DIRECTORY,
                NodeKind::File => FILE_ATTRIBUTE_ARCHIVE,
            };
            let now = std::time::SystemTime::now();
            let data = dokan::FindData {
                attributes,
                creation_time: now,
                last_access_time: now,
                last_write_time: now,
                file_size: entry.size.unwrap_or(0),
                file_name,
            };
            // 缓冲区满时 Dokan 会再次调用，忽略即可
            let _ = fill_find_data(&data);
        }
        Ok(())
    }

    fn get_disk_free_space(
        &'h self,
        _info: &OperationInfo<'c, 'h, Self>,
    ) -> OperationResult<DiskSpaceInfo> {
        let space = self.adapter.disk_free_space();
        Ok(DiskSpaceInfo {
            byte_count: space.total_bytes,
            free_byte_count: space.free_bytes,
            available_byte_count: space.available_bytes,
        })
    }

    fn get_volume_information(
        &'h self,
        _info: &OperationInfo<'c, 'h, Self>,
    ) -> OperationResult<VolumeInfo> {
        let volume = self.adapter.volume_information();
        Ok(VolumeInfo {
            name: U16CString::from_str(&volume.label).map_err(|_| STATUS_INVALID_PARAMETER)?,
            serial_number: volume.serial_number,
            max_component_length: volume.max_component_length,
            fs_flags: FILE_CASE_PRESERVED_NAMES | FILE_UNICODE_ON_DISK,
            fs_name: U16CString::from_str(&volume.fs_name).map_err(|_| STATUS_INVALID_PARAMETER)?,
        })
    }
}
