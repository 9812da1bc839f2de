//! 不含驱动后端的构建：挂载一律报“驱动不可用”。

use std::sync::Arc;

use super::{DriverError, DriverOptions, DriverSubsystem};
use crate::virtual_driver::adapter::DriverAdapter;

#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedDriver;

impl DriverSubsystem for UnsupportedDriver {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn register(
        &self,
        _mount_id: &str,
        _operations: Arc<DriverAdapter>,
        _options: &DriverOptions,
        _ready: &mut dyn FnMut(),
    ) -> Result<(), DriverError> {
        Err(DriverError::Unavailable(
            "当前构建不包含虚拟盘驱动后端（需启用 feature `virtual-driver`，且仅支持 Windows/Linux/macOS）"
                .to_string(),
        ))
    }

    fn remove_mount_point(&self, _mount_id: &str) {}

    fn force_remove_mount_point(&self, _mount_id: &str) -> bool {
        false
    }
}
