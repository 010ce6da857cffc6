//! 分层注册表与覆盖栈。
//!
//! 基础层承载常规注册，覆盖层自顶向下遮蔽查找；每次注册、
//! 压层、改写或弹层都递增 epoch，使已编译的计划在下次解析时
//! 重新编译。单例槽归属于定义它的层，层弹出时槽随之丢弃。

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::key::Key;
use crate::provider::{ProviderRecord, Scope, Svc};

/// 单例槽：值的读写由互斥量保护，首次构造由异步锁串行化，
/// 锁按键独立，互不影响其他键的解析。
pub(crate) struct SingletonSlot {
    value: Mutex<Option<Svc>>,
    init: tokio::sync::Mutex<()>,
}

impl SingletonSlot {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            init: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> Option<Svc> {
        self.value.lock().clone()
    }

    pub(crate) fn set(&self, value: Svc) {
        *self.value.lock() = Some(value);
    }

    pub(crate) fn clear(&self) {
        *self.value.lock() = None;
    }

    pub(crate) async fn lock_init(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.init.lock().await
    }

    /// 同步路径使用；不得在异步上下文中调用
    pub(crate) fn blocking_lock_init(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.init.blocking_lock()
    }
}

pub(crate) type Slot = Arc<SingletonSlot>;

struct Layer {
    id: u64,
    providers: HashMap<Key, Arc<ProviderRecord>>,
    slots: HashMap<Key, Slot>,
}

impl Layer {
    fn new(id: u64) -> Self {
        Self {
            id,
            providers: HashMap::new(),
            slots: HashMap::new(),
        }
    }

    /// 写入记录；单例键总是换上全新的槽，避免旧工厂的缓存值续命
    fn insert(&mut self, record: ProviderRecord) {
        let key = record.key.clone();
        if record.scope == Scope::Singleton {
            self.slots.insert(key.clone(), Arc::new(SingletonSlot::new()));
        } else {
            self.slots.remove(&key);
        }
        self.providers.insert(key, Arc::new(record));
    }
}

struct RegistryState {
    base: Layer,
    overrides: Vec<Layer>,
    next_layer_id: u64,
}

pub(crate) struct Registry {
    state: RwLock<RegistryState>,
    epoch: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                base: Layer::new(0),
                overrides: Vec::new(),
                next_layer_id: 1,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 注册进基础层；严格模式下重复键报错，否则后写覆盖
    pub(crate) fn register(&self, record: ProviderRecord, strict: bool) -> Result<Key> {
        let key = record.key.clone();
        let mut state = self.state.write();
        if strict && state.base.providers.contains_key(&key) {
            return Err(Error::DuplicateRegistration { key });
        }
        state.base.insert(record);
        let epoch = self.bump();
        tracing::debug!(key = %key, epoch, "注册提供者");
        Ok(key)
    }

    /// 压入只含一个替换项的新覆盖层，返回层号
    pub(crate) fn push_layer(&self, record: ProviderRecord) -> u64 {
        let mut state = self.state.write();
        let id = state.next_layer_id;
        state.next_layer_id += 1;
        let mut layer = Layer::new(id);
        layer.insert(record);
        state.overrides.push(layer);
        let epoch = self.bump();
        tracing::debug!(layer = id, epoch, "压入覆盖层");
        id
    }

    /// 向指定层追加替换项；该层必须仍是栈顶
    pub(crate) fn set_in_layer(&self, layer_id: u64, record: ProviderRecord) -> Result<Key> {
        let key = record.key.clone();
        let mut state = self.state.write();
        match state.overrides.last_mut() {
            Some(top) if top.id == layer_id => {
                top.insert(record);
                self.bump();
                Ok(key)
            }
            _ => Err(Error::OverrideStackCorruption { layer: layer_id }),
        }
    }

    /// 弹出栈顶层；层号不匹配视为栈损坏。返回该层覆盖过的键。
    pub(crate) fn pop_layer(&self, layer_id: u64) -> Result<Vec<Key>> {
        let mut state = self.state.write();
        match state.overrides.pop() {
            Some(layer) if layer.id == layer_id => {
                let keys: Vec<Key> = layer.providers.keys().cloned().collect();
                let epoch = self.bump();
                tracing::debug!(layer = layer_id, epoch, "弹出覆盖层");
                Ok(keys)
            }
            Some(layer) => {
                state.overrides.push(layer);
                Err(Error::OverrideStackCorruption { layer: layer_id })
            }
            None => Err(Error::OverrideStackCorruption { layer: layer_id }),
        }
    }

    /// 取一致性读视图；持有期间注册表不会变化
    pub(crate) fn view(&self) -> RegistryView<'_> {
        let state = self.state.read();
        let epoch = self.epoch.load(Ordering::Acquire);
        RegistryView { state, epoch }
    }

    pub(crate) fn lookup(&self, key: &Key) -> Option<(Arc<ProviderRecord>, Option<Slot>)> {
        self.view().lookup(key)
    }

    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.lookup(key).is_some()
    }

    pub(crate) fn override_depth(&self) -> usize {
        self.state.read().overrides.len()
    }

    /// 定点失效：清空该键在所有层位上已缓存的单例值，计划不受影响
    pub(crate) fn invalidate(&self, key: &Key) {
        let state = self.state.read();
        if let Some(slot) = state.base.slots.get(key) {
            slot.clear();
        }
        for layer in &state.overrides {
            if let Some(slot) = layer.slots.get(key) {
                slot.clear();
            }
        }
    }
}

/// 覆盖感知的注册表读视图
pub(crate) struct RegistryView<'a> {
    state: RwLockReadGuard<'a, RegistryState>,
    epoch: u64,
}

impl RegistryView<'_> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 自顶向下查找，首个命中层同时给出该层的单例槽
    pub(crate) fn lookup(&self, key: &Key) -> Option<(Arc<ProviderRecord>, Option<Slot>)> {
        for layer in self.state.overrides.iter().rev() {
            if let Some(record) = layer.providers.get(key) {
                return Some((record.clone(), layer.slots.get(key).cloned()));
            }
        }
        self.state
            .base
            .providers
            .get(key)
            .map(|record| (record.clone(), self.state.base.slots.get(key).cloned()))
    }
}
