use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// 最近一次错误消息（后写覆盖先写，不做合并）
pub struct ErrorSlot {
    message: ArcSwapOption<String>,
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self {
            message: ArcSwapOption::empty(),
        }
    }
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        self.message.store(Some(Arc::new(message.into())));
    }

    pub fn get(&self) -> Option<String> {
        self.message.load_full().map(|m| m.as_ref().clone())
    }
}

impl std::fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ErrorSlot").field(&self.get()).finish()
    }
}
