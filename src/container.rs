//! 容器：注册、覆盖、解析与诊断的组合根。
//!
//! 所有方法都只要求共享引用，容器自身可以安全地跨线程共享。
//! 解析入口先取（或编译）计划再交给执行器，注册与覆盖推进纪元，
//! 过期计划在缓存中惰性失效。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ContainerOptions, ContainerStats};
use crate::errors::{Error, Result};
use crate::executor::{self, ExecEnv};
use crate::hooks::{HookEvent, HookId, HookSet};
use crate::key::Key;
use crate::plan::{self, Plan, PlanCache, PlanExport};
use crate::provider::{ProviderInfo, ProviderSpec, Svc};
use crate::registry::Registry;
use crate::scope::RequestScopes;

/// 解析计数器，松散序累加，快照时一并读出
pub(crate) struct InnerStats {
    resolutions: AtomicUsize,
    singleton_hits: AtomicUsize,
    request_hits: AtomicUsize,
    plans_compiled: AtomicUsize,
    plan_cache_hits: AtomicUsize,
    registrations: AtomicUsize,
}

impl InnerStats {
    pub(crate) fn new() -> Self {
        Self {
            resolutions: AtomicUsize::new(0),
            singleton_hits: AtomicUsize::new(0),
            request_hits: AtomicUsize::new(0),
            plans_compiled: AtomicUsize::new(0),
            plan_cache_hits: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn record_resolution(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_singleton_hit(&self) {
        self.singleton_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_hit(&self) {
        self.request_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_plan_compiled(&self) {
        self.plans_compiled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_plan_cache_hit(&self) {
        self.plan_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ContainerStats {
        ContainerStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            singleton_hits: self.singleton_hits.load(Ordering::Relaxed),
            request_hits: self.request_hits.load(Ordering::Relaxed),
            plans_compiled: self.plans_compiled.load(Ordering::Relaxed),
            plan_cache_hits: self.plan_cache_hits.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
        }
    }
}

/// 依赖解析容器
pub struct Container {
    registry: Registry,
    hooks: HookSet,
    scopes: RequestScopes,
    plans: PlanCache,
    stats: InnerStats,
    options: ContainerOptions,
}

impl Container {
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        Self {
            registry: Registry::new(),
            hooks: HookSet::new(),
            scopes: RequestScopes::new(),
            plans: PlanCache::new(options.normalized_capacity()),
            stats: InnerStats::new(),
            options,
        }
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// 注册提供者；严格模式下重复键报错，否则后写覆盖并清掉旧缓存
    pub fn register(&self, spec: ProviderSpec) -> Result<Key> {
        let record = spec.into_record()?;
        let key = self
            .registry
            .register(record, self.options.strict_registration)?;
        self.scopes.invalidate(&key);
        self.stats.record_registration();
        Ok(key)
    }

    pub fn contains(&self, key: impl Into<Key>) -> bool {
        self.registry.contains(&key.into())
    }

    /// 当前覆盖视图下的提供者元信息
    pub fn provider_info(&self, key: impl Into<Key>) -> Option<ProviderInfo> {
        let (record, _) = self.registry.lookup(&key.into())?;
        Some(ProviderInfo {
            key: record.key.clone(),
            scope: record.scope,
            is_async: record.is_async(),
            singleton: record.scope == crate::provider::Scope::Singleton,
            dependencies: record.dependencies.clone(),
        })
    }

    /// 同步解析。首次构造单例会阻塞等待同键的并发构造，
    /// 不要在异步运行时线程上调用，改用 [`Container::resolve_async`]。
    pub fn resolve<T>(&self, key: impl Into<Key>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let mut values = self.resolve_roots_sync(vec![key.clone()])?;
        let value = values.pop().ok_or_else(|| Error::UnresolvedDependency {
            key: key.clone(),
            requested_by: None,
        })?;
        downcast::<T>(&key, value)
    }

    pub async fn resolve_async<T>(&self, key: impl Into<Key>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let mut values = self.resolve_roots_async(vec![key.clone()]).await?;
        let value = values.pop().ok_or_else(|| Error::UnresolvedDependency {
            key: key.clone(),
            requested_by: None,
        })?;
        downcast::<T>(&key, value)
    }

    /// 多根解析：一个计划覆盖全部根，结果按根的顺序返回
    pub fn resolve_many<I, K>(&self, keys: I) -> Result<Vec<Svc>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let roots: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.resolve_roots_sync(roots)
    }

    pub async fn resolve_many_async<I, K>(&self, keys: I) -> Result<Vec<Svc>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let roots: Vec<Key> = keys.into_iter().map(Into::into).collect();
        self.resolve_roots_async(roots).await
    }

    /// 在新的请求作用域内运行 future，作用域内解析的请求级值共享同一桶
    pub async fn scope<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.scopes.enter(fut).await
    }

    /// 压入覆盖层并返回守卫，守卫离开作用域时自动释放该层
    pub fn push_override(&self, spec: ProviderSpec) -> Result<OverrideGuard<'_>> {
        let record = spec.into_record()?;
        let key = record.key.clone();
        let layer_id = self.registry.push_layer(record);
        self.scopes.invalidate(&key);
        Ok(OverrideGuard {
            container: self,
            layer_id,
            released: false,
        })
    }

    /// 定点失效：清掉该键所有层位的单例缓存与全部请求桶里的值
    pub fn invalidate(&self, key: impl Into<Key>) {
        let key = key.into();
        self.registry.invalidate(&key);
        self.scopes.invalidate(&key);
        tracing::debug!(key = %key, "定点失效缓存");
    }

    /// 向所属层的单例槽直接写入值，跳过工厂（测试夹具注入）
    pub fn seed_singleton(&self, key: impl Into<Key>, value: Svc) -> Result<()> {
        let key = key.into();
        match self.registry.lookup(&key) {
            Some((_, Some(slot))) => {
                slot.set(value);
                Ok(())
            }
            Some((_, None)) => Err(Error::NotSingleton { key }),
            None => Err(Error::UnresolvedDependency {
                key,
                requested_by: None,
            }),
        }
    }

    /// 读取单例槽当前值，不执行任何工厂
    pub fn cached_singleton(&self, key: impl Into<Key>) -> Option<Svc> {
        let (_, slot) = self.registry.lookup(&key.into())?;
        slot?.get()
    }

    pub fn add_hook<F>(&self, listener: F) -> HookId
    where
        F: Fn(&HookEvent) + Send + Sync + 'static,
    {
        self.hooks.add(listener)
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        self.hooks.remove(id)
    }

    /// 导出给定根集合的计划快照
    pub fn export_plan<I, K>(&self, keys: I) -> Result<PlanExport>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let roots: Vec<Key> = keys.into_iter().map(Into::into).collect();
        Ok(self.plan_for(roots)?.export())
    }

    pub fn plan_dot<I, K>(&self, keys: I) -> Result<String>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Ok(self.export_plan(keys)?.to_dot())
    }

    pub fn stats(&self) -> ContainerStats {
        self.stats.snapshot()
    }

    pub fn epoch(&self) -> u64 {
        self.registry.epoch()
    }

    pub fn override_depth(&self) -> usize {
        self.registry.override_depth()
    }

    fn resolve_roots_sync(&self, roots: Vec<Key>) -> Result<Vec<Svc>> {
        self.stats.record_resolution();
        let plan = self.plan_for(roots)?;
        let env = self.env();
        executor::execute_sync(&plan, &env)
    }

    async fn resolve_roots_async(&self, roots: Vec<Key>) -> Result<Vec<Svc>> {
        self.stats.record_resolution();
        let plan = self.plan_for(roots)?;
        let env = self.env();
        executor::execute_async(&plan, &env).await
    }

    fn env(&self) -> ExecEnv<'_> {
        ExecEnv {
            hooks: &self.hooks,
            stats: &self.stats,
            bucket: self.scopes.current_bucket(),
        }
    }

    fn plan_for(&self, roots: Vec<Key>) -> Result<Arc<Plan>> {
        let epoch = self.registry.epoch();
        if let Some(plan) = self.plans.get(&roots, epoch) {
            self.stats.record_plan_cache_hit();
            return Ok(plan);
        }
        let plan = {
            let view = self.registry.view();
            Arc::new(plan::compile(&roots, &view)?)
        };
        self.stats.record_plan_compiled();
        self.plans.insert(roots, plan.clone());
        Ok(plan)
    }

    fn pop_override(&self, layer_id: u64) -> Result<()> {
        let keys = self.registry.pop_layer(layer_id)?;
        // 该层工厂产出的请求级缓存值随层一起失效
        for key in &keys {
            self.scopes.invalidate(key);
        }
        Ok(())
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T>(key: &Key, value: Svc) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
{
    value.downcast::<T>().map_err(|_| Error::TypeMismatch {
        key: key.clone(),
        expected: std::any::type_name::<T>(),
    })
}

/// 覆盖层守卫：Drop 时释放自己的层，越序释放报错且不动栈
pub struct OverrideGuard<'a> {
    container: &'a Container,
    layer_id: u64,
    released: bool,
}

impl OverrideGuard<'_> {
    /// 向本层追加或替换提供者，仅当本层仍在栈顶时允许
    pub fn set(&self, spec: ProviderSpec) -> Result<Key> {
        let record = spec.into_record()?;
        let key = self
            .container
            .registry
            .set_in_layer(self.layer_id, record)?;
        self.container.scopes.invalidate(&key);
        Ok(key)
    }

    /// 显式释放；失败时层与守卫都保持原状，之后仍可按序释放或交给 Drop
    pub fn release(&mut self) -> Result<()> {
        self.container.pop_override(self.layer_id)?;
        self.released = true;
        Ok(())
    }

    pub fn layer_id(&self) -> u64 {
        self.layer_id
    }
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.container.pop_override(self.layer_id) {
            tracing::warn!(layer = self.layer_id, error = %err, "覆盖层释放失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Scope;

    #[test]
    fn test_register_and_resolve_typed() {
        let container = Container::new();
        container
            .register(ProviderSpec::sync("answer", |_| Ok(42u32)))
            .unwrap();

        let value = container.resolve::<u32>("answer").unwrap();
        assert_eq!(*value, 42);
        assert_eq!(container.stats().registrations, 1);
        assert_eq!(container.stats().resolutions, 1);
    }

    #[test]
    fn test_resolve_unknown_key_fails() {
        let container = Container::new();
        let err = container.resolve::<u32>("nowhere").unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency { .. }));
    }

    #[test]
    fn test_type_mismatch_names_expected_type() {
        let container = Container::new();
        container
            .register(ProviderSpec::sync("answer", |_| Ok(42u32)))
            .unwrap();

        let err = container.resolve::<String>("answer").unwrap_err();
        assert!(err.to_string().contains("alloc::string::String"));
    }

    #[test]
    fn test_provider_info_reports_metadata() {
        let container = Container::new();
        container
            .register(
                ProviderSpec::async_fn("db", |_| async { Ok(1u32) })
                    .singleton()
                    .with_deps(["cfg"]),
            )
            .unwrap();

        let info = container.provider_info("db").unwrap();
        assert_eq!(info.key.as_str(), "db");
        assert_eq!(info.scope, Scope::Singleton);
        assert!(info.is_async);
        assert!(info.singleton);
        assert_eq!(info.dependencies.len(), 1);

        assert!(container.provider_info("missing").is_none());
        assert!(container.contains("db"));
        assert!(!container.contains("missing"));
    }

    #[test]
    fn test_seed_and_read_singleton_slot() {
        let container = Container::new();
        container
            .register(ProviderSpec::sync("cfg", |_| Ok(String::from("from factory"))).singleton())
            .unwrap();
        container
            .register(ProviderSpec::sync("plain", |_| Ok(1u32)))
            .unwrap();

        assert!(container.cached_singleton("cfg").is_none());
        container
            .seed_singleton("cfg", Arc::new(String::from("seeded")))
            .unwrap();

        let value = container.resolve::<String>("cfg").unwrap();
        assert_eq!(*value, "seeded");
        assert!(container.cached_singleton("cfg").is_some());

        let err = container
            .seed_singleton("plain", Arc::new(1u32))
            .unwrap_err();
        assert!(matches!(err, Error::NotSingleton { .. }));

        let err = container
            .seed_singleton("missing", Arc::new(1u32))
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedDependency { .. }));
    }

    #[test]
    fn test_override_guard_releases_on_drop() {
        let container = Container::new();
        container
            .register(ProviderSpec::sync("svc", |_| Ok(1u32)))
            .unwrap();

        {
            let _guard = container
                .push_override(ProviderSpec::sync("svc", |_| Ok(2u32)))
                .unwrap();
            assert_eq!(container.override_depth(), 1);
            assert_eq!(*container.resolve::<u32>("svc").unwrap(), 2);
        }

        assert_eq!(container.override_depth(), 0);
        assert_eq!(*container.resolve::<u32>("svc").unwrap(), 1);
    }

    #[test]
    fn test_plan_cache_hits_and_epoch_invalidation() {
        let container = Container::new();
        container
            .register(ProviderSpec::sync("a", |_| Ok(1u32)))
            .unwrap();

        container.resolve::<u32>("a").unwrap();
        container.resolve::<u32>("a").unwrap();
        let stats = container.stats();
        assert_eq!(stats.plans_compiled, 1);
        assert_eq!(stats.plan_cache_hits, 1);

        // 注册推进纪元，旧计划失效并重新编译
        container
            .register(ProviderSpec::sync("b", |_| Ok(2u32)))
            .unwrap();
        container.resolve::<u32>("a").unwrap();
        let stats = container.stats();
        assert_eq!(stats.plans_compiled, 2);
        assert_eq!(stats.plan_cache_hits, 1);
    }

    #[test]
    fn test_zero_capacity_options_still_cache_one_plan() {
        let container = Container::with_options(ContainerOptions {
            strict_registration: false,
            plan_cache_capacity: 0,
        });
        container
            .register(ProviderSpec::sync("a", |_| Ok(1u32)))
            .unwrap();

        container.resolve::<u32>("a").unwrap();
        container.resolve::<u32>("a").unwrap();
        assert_eq!(container.stats().plan_cache_hits, 1);
    }
}
