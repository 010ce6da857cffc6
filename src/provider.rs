//! 提供者记录与工厂表示。
//!
//! 工厂以同步/异步两个标签变体存储，规划与执行阶段按标签分派，
//! 不做任何运行时类型探测；作用域在注册时归一化后不再变化。

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::errors::{BoxError, Result};
use crate::key::Key;

/// 解析产物：类型擦除的共享服务值
pub type Svc = Arc<dyn Any + Send + Sync>;

/// 作用域：解析值的缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// 每次解析重新构造
    Transient,
    /// 容器生命周期内只构造一次
    Singleton,
    /// 同一逻辑请求内复用
    Request,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Scope::Transient => "transient",
            Scope::Singleton => "singleton",
            Scope::Request => "request",
        };
        f.write_str(label)
    }
}

/// 传给工厂的已解析依赖值，顺序与声明一致
pub struct Deps(Vec<Svc>);

impl Deps {
    pub(crate) fn new(values: Vec<Svc>) -> Self {
        Deps(values)
    }

    /// 取第 `index` 个依赖并向下转型
    pub fn get<T: Send + Sync + 'static>(&self, index: usize) -> std::result::Result<Arc<T>, BoxError> {
        let value = self.0.get(index).ok_or_else(|| -> BoxError {
            format!(
                "dependency index {index} out of range ({} available)",
                self.0.len()
            )
            .into()
        })?;
        value.clone().downcast::<T>().map_err(|_| -> BoxError {
            format!("dependency {index} is not a {}", std::any::type_name::<T>()).into()
        })
    }

    /// 按原始擦除形式取依赖
    pub fn raw(&self, index: usize) -> Option<&Svc> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 工厂：同步或异步构造函数
#[derive(Clone)]
pub enum Factory {
    Sync(Arc<dyn Fn(Deps) -> std::result::Result<Svc, BoxError> + Send + Sync>),
    Async(Arc<dyn Fn(Deps) -> BoxFuture<'static, std::result::Result<Svc, BoxError>> + Send + Sync>),
}

impl Factory {
    pub fn is_async(&self) -> bool {
        matches!(self, Factory::Async(_))
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Factory::Sync(_) => f.write_str("Factory::Sync"),
            Factory::Async(_) => f.write_str("Factory::Async"),
        }
    }
}

/// 注册请求：键、工厂、依赖与作用域
pub struct ProviderSpec {
    key: Key,
    factory: Factory,
    dependencies: Vec<Key>,
    scope: Scope,
    singleton: bool,
}

impl ProviderSpec {
    /// 注册同步工厂
    pub fn sync<T, F>(key: impl Into<Key>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Deps) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        let erased = Arc::new(move |deps| factory(deps).map(|value| Arc::new(value) as Svc));
        Self {
            key: key.into(),
            factory: Factory::Sync(erased),
            dependencies: Vec::new(),
            scope: Scope::Transient,
            singleton: false,
        }
    }

    /// 注册异步工厂
    pub fn async_fn<T, F, Fut>(key: impl Into<Key>, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Deps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        let erased = Arc::new(move |deps| {
            let fut = factory(deps);
            async move { fut.await.map(|value| Arc::new(value) as Svc) }.boxed()
        });
        Self {
            key: key.into(),
            factory: Factory::Async(erased),
            dependencies: Vec::new(),
            scope: Scope::Transient,
            singleton: false,
        }
    }

    /// 声明依赖键，顺序即工厂参数顺序
    pub fn with_deps<I, K>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// 指定作用域
    pub fn in_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// 标记为单例，覆盖其他作用域声明
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub(crate) fn into_record(self) -> Result<ProviderRecord> {
        // 空键在注册入口统一拒绝，与显式键校验一致
        let key = Key::explicit(self.key.as_str())?;
        let scope = if self.singleton {
            Scope::Singleton
        } else {
            self.scope
        };
        Ok(ProviderRecord {
            key,
            factory: self.factory,
            dependencies: self.dependencies,
            scope,
        })
    }
}

/// 归一化后的提供者记录
#[derive(Debug, Clone)]
pub(crate) struct ProviderRecord {
    pub key: Key,
    pub factory: Factory,
    pub dependencies: Vec<Key>,
    pub scope: Scope,
}

impl ProviderRecord {
    pub(crate) fn is_async(&self) -> bool {
        self.factory.is_async()
    }
}

/// 提供者元信息快照，供诊断输出
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub key: Key,
    pub scope: Scope,
    pub is_async: bool,
    pub singleton: bool,
    pub dependencies: Vec<Key>,
}
