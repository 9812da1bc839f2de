//! 桥接配置（JSON，camelCase，所有字段均有默认值）。
//!
//! 文件不存在时使用默认值；环境变量优先级最高：
//! - `QUARKDRIVE_WORKER_COUNT`
//! - `QUARKDRIVE_STARTUP_TIMEOUT_MS`

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VdError, VdResult};

pub const ENV_WORKER_COUNT: &str = "QUARKDRIVE_WORKER_COUNT";
pub const ENV_STARTUP_TIMEOUT_MS: &str = "QUARKDRIVE_STARTUP_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// 等待驱动确认挂载的时间
    pub startup_timeout_ms: u64,
    /// 优雅卸载后等待线程退出的时间
    pub graceful_unmount_timeout_ms: u64,
    /// 强制卸载后再等待的时间
    pub forced_unmount_timeout_ms: u64,
    /// 每个挂载的 sync_* 工作线程数
    pub worker_count: usize,
    /// 挂载标识最大长度（Windows MAX_PATH）
    pub max_mount_id_len: usize,
    pub volume: VolumeSettings,
    pub driver: DriverSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            graceful_unmount_timeout_ms: 15_000,
            forced_unmount_timeout_ms: 3_000,
            worker_count: 4,
            max_mount_id_len: 260,
            volume: VolumeSettings::default(),
            driver: DriverSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeSettings {
    pub label: String,
    pub fs_name: String,
    pub serial_number: u32,
    pub max_component_length: u32,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            label: "QuarkDrive".to_string(),
            fs_name: "NTFS".to_string(),
            serial_number: 0x19831116,
            max_component_length: 255,
            total_bytes: 1 << 40,
            free_bytes: 1 << 40,
        }
    }
}

/// 传给驱动框架的参数（Dokan MountOptions / FUSE MountOption）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverSettings {
    pub thread_timeout_ms: u32,
    pub current_session_only: bool,
    pub case_sensitive: bool,
    pub allocation_unit_size: u32,
    pub sector_size: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            thread_timeout_ms: 30_000,
            current_session_only: true,
            case_sensitive: true,
            allocation_unit_size: 4096,
            sector_size: 512,
        }
    }
}

impl BridgeSettings {
    /// 读取配置文件并应用环境变量覆盖
    pub fn load(path: &Path) -> VdResult<Self> {
        let mut settings = Self::load_file(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn load_file(path: &Path) -> VdResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "配置文件不存在，使用默认配置");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| VdError::Config(format!("读取配置文件失败 {}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| VdError::Config(format!("解析配置文件失败 {}: {}", path.display(), e)))
    }

    /// `lookup` 便于测试时不改动进程环境
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> VdResult<()> {
        if let Some(v) = lookup(ENV_WORKER_COUNT) {
            self.worker_count = v
                .trim()
                .parse()
                .map_err(|_| VdError::Config(format!("{} 不是有效整数: {:?}", ENV_WORKER_COUNT, v)))?;
        }
        if let Some(v) = lookup(ENV_STARTUP_TIMEOUT_MS) {
            self.startup_timeout_ms = v.trim().parse().map_err(|_| {
                VdError::Config(format!("{} 不是有效整数: {:?}", ENV_STARTUP_TIMEOUT_MS, v))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> VdResult<()> {
        if self.worker_count == 0 {
            return Err(VdError::Config("workerCount 至少为 1".to_string()));
        }
        if self.max_mount_id_len == 0 {
            return Err(VdError::Config("maxMountIdLen 至少为 1".to_string()));
        }
        Ok(())
    }

    /// 写入临时文件后替换，避免留下半截配置
    pub fn save(&self, path: &Path) -> VdResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| VdError::Config(format!("创建配置目录失败: {}", e)))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| VdError::Config(format!("序列化配置失败: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| VdError::Config(format!("写入配置失败: {}", e)))?;
        fs::rename(&tmp, path).map_err(|e| VdError::Config(format!("替换配置文件失败: {}", e)))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn graceful_unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_unmount_timeout_ms)
    }

    pub fn forced_unmount_timeout(&self) -> Duration {
        Duration::from_millis(self.forced_unmount_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = BridgeSettings::load_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, BridgeSettings::default());
        assert_eq!(settings.startup_timeout(), Duration::from_secs(10));
        assert_eq!(settings.graceful_unmount_timeout(), Duration::from_secs(15));
        assert_eq!(settings.forced_unmount_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarkdrive.json");
        fs::write(&path, r#"{ "workerCount": 2, "volume": { "label": "Scratch" } }"#).unwrap();

        let settings = BridgeSettings::load_file(&path).unwrap();
        assert_eq!(settings.worker_count, 2);
        assert_eq!(settings.volume.label, "Scratch");
        assert_eq!(settings.volume.fs_name, "NTFS");
        assert_eq!(settings.max_mount_id_len, 260);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ workerCount: ").unwrap();
        assert!(matches!(
            BridgeSettings::load_file(&path),
            Err(VdError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = BridgeSettings::default();
        settings
            .apply_env(|key| match key {
                ENV_WORKER_COUNT => Some("8".to_string()),
                ENV_STARTUP_TIMEOUT_MS => Some("250".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(settings.worker_count, 8);
        assert_eq!(settings.startup_timeout(), Duration::from_millis(250));

        let err = settings.apply_env(|key| (key == ENV_WORKER_COUNT).then(|| "many".to_string()));
        assert!(matches!(err, Err(VdError::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("quarkdrive.json");
        let mut settings = BridgeSettings::default();
        settings.worker_count = 1;
        settings.save(&path).unwrap();
        assert_eq!(BridgeSettings::load_file(&path).unwrap(), settings);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut settings = BridgeSettings::default();
        settings.worker_count = 0;
        assert!(settings.validate().is_err());
    }
}
