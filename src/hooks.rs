//! 生命周期钩子分发。
//!
//! 监听器按注册顺序同步回调，发生在解析的关键路径上。单个监听器
//! panic 会被捕获并记录，既不影响其余监听器也不影响解析结果。
//! 注册返回的 [`HookId`] 是移除凭据，同一闭包注册两次得到两个凭据。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::key::Key;
use crate::provider::Scope;

/// 解析过程中产生的钩子事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    ProviderStart {
        key: Key,
        is_async: bool,
    },
    ProviderEnd {
        key: Key,
        is_async: bool,
        duration_seconds: f64,
    },
    CacheHit {
        key: Key,
        scope: Scope,
    },
}

impl HookEvent {
    pub fn key(&self) -> &Key {
        match self {
            HookEvent::ProviderStart { key, .. }
            | HookEvent::ProviderEnd { key, .. }
            | HookEvent::CacheHit { key, .. } => key,
        }
    }
}

/// 监听器移除凭据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type HookFn = Arc<dyn Fn(&HookEvent) + Send + Sync>;

pub(crate) struct HookSet {
    listeners: RwLock<Vec<(HookId, HookFn)>>,
    next_id: AtomicU64,
}

impl HookSet {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add<F>(&self, listener: F) -> HookId
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub(crate) fn remove(&self, id: HookId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(held, _)| *held != id);
        listeners.len() != before
    }

    /// 无监听器时执行器跳过事件构造，此判断在热路径上
    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub(crate) fn emit(&self, event: &HookEvent) {
        // 克隆出监听器快照再回调，分发期间不持锁
        let listeners: Vec<(HookId, HookFn)> = self.listeners.read().clone();
        for (_, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(key = %event.key(), "钩子监听器 panic，已忽略");
            }
        }
    }
}

/// 把钩子事件写入 tracing 的现成监听器
pub fn tracing_hook() -> impl Fn(&HookEvent) + Send + Sync + 'static {
    |event: &HookEvent| match event {
        HookEvent::ProviderStart { key, is_async } => {
            tracing::debug!(key = %key, is_async, "提供者开始构造");
        }
        HookEvent::ProviderEnd {
            key,
            is_async,
            duration_seconds,
        } => {
            tracing::debug!(key = %key, is_async, duration_seconds, "提供者构造完成");
        }
        HookEvent::CacheHit { key, scope } => {
            tracing::trace!(key = %key, scope = %scope, "缓存命中");
        }
    }
}
