//! 全局挂载表：标识唯一性与“挂载是否存在”的判断只在这里做。

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{VdError, VdResult};

use super::mount::{Mount, MountState};

#[derive(Default)]
pub struct MountRegistry {
    mounts: RwLock<HashMap<String, Arc<Mount>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Mount>>> {
        self.mounts.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Mount>>> {
        self.mounts.write().unwrap_or_else(|p| p.into_inner())
    }

    /// 占位：标识已存在（任何状态）时拒绝
    pub fn reserve(&self, mount: Arc<Mount>) -> VdResult<()> {
        let mut mounts = self.write();
        if mounts.contains_key(mount.id()) {
            return Err(VdError::DuplicateMount(mount.id().to_string()));
        }
        mounts.insert(mount.id().to_string(), mount);
        Ok(())
    }

    /// 只返回“已挂载或正在挂载”的条目；驱动回调线程并发调用
    pub fn resolve(&self, id: &str) -> Option<Arc<Mount>> {
        self.read()
            .get(id)
            .filter(|m| m.state().is_visible())
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mount>> {
        self.read().get(id).cloned()
    }

    /// 幂等
    pub fn remove(&self, id: &str) -> Option<Arc<Mount>> {
        self.write().remove(id)
    }

    /// 只有表中仍是同一个挂载实例时才移除（避免误删同名的新挂载）
    pub fn remove_if_same(&self, mount: &Arc<Mount>) -> bool {
        let mut mounts = self.write();
        match mounts.get(mount.id()) {
            Some(current) if Arc::ptr_eq(current, mount) => {
                mounts.remove(mount.id());
                true
            }
            _ => false,
        }
    }

    /// 可见挂载的标识，按名字排序
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|m| m.state().is_visible())
            .map(|m| m.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<Mount>> {
        self.read().values().cloned().collect()
    }

    pub fn any_in_state(&self, state: MountState) -> bool {
        self.read().values().any(|m| m.state() == state)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_driver::gate::FreeThreaded;
    use crate::virtual_driver::last_error::ErrorSlot;

    fn mount(id: &str) -> Arc<Mount> {
        Arc::new(Mount::new(
            id,
            "test",
            Arc::new(FreeThreaded),
            Arc::new(ErrorSlot::new()),
        ))
    }

    #[test]
    fn test_reserve_rejects_duplicates() {
        let registry = MountRegistry::new();
        registry.reserve(mount("Z")).unwrap();
        assert_eq!(
            registry.reserve(mount("Z")),
            Err(VdError::DuplicateMount("Z".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_visibility_follows_state() {
        let registry = MountRegistry::new();
        let m = mount("Z");
        registry.reserve(Arc::clone(&m)).unwrap();
        assert!(registry.resolve("Z").is_some());
        assert!(registry.any_in_state(MountState::Mounting));

        assert!(m.mark_registered());
        assert_eq!(registry.ids(), vec!["Z".to_string()]);

        assert!(m.begin_unmount());
        assert!(registry.resolve("Z").is_none());
        assert!(registry.ids().is_empty());
        // 卸载中的条目仍占着标识
        assert!(registry.get("Z").is_some());
        assert!(registry.reserve(mount("Z")).is_err());
    }

    #[test]
    fn test_remove_is_idempotent_and_identity_checked() {
        let registry = MountRegistry::new();
        let old = mount("Z");
        registry.reserve(Arc::clone(&old)).unwrap();
        assert!(registry.remove("Z").is_some());
        assert!(registry.remove("Z").is_none());

        let new = mount("Z");
        registry.reserve(Arc::clone(&new)).unwrap();
        assert!(!registry.remove_if_same(&old));
        assert!(registry.remove_if_same(&new));
        assert_eq!(registry.len(), 0);
    }
}
