//! 解析引擎的错误类型。
//!
//! 编译期错误（环、缺失依赖、同步计划中的异步提供者）在任何工厂
//! 执行之前产生；工厂自身的失败包上出错的键后原样向调用方传播。

use crate::key::Key;
use thiserror::Error;

/// 工厂返回的装箱错误类型
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 本 crate 的统一 Result 别名
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// 依赖图中存在环，携带完整的环路径
    #[error("Dependency cycle detected: {}", format_cycle(.path))]
    CycleDetected { path: Vec<Key> },

    /// 可见层中找不到键对应的提供者
    #[error("No provider registered for key '{key}'{}", requested_by_suffix(.requested_by))]
    UnresolvedDependency {
        key: Key,
        requested_by: Option<Key>,
    },

    /// 同步解析遇到异步提供者
    #[error("Async provider '{key}' found in sync plan; use resolve_async")]
    AsyncProviderInSyncPlan { key: Key },

    /// 覆盖层越序释放
    #[error("Override layer {layer} is not the top of the override stack")]
    OverrideStackCorruption { layer: u64 },

    /// 严格注册模式下的重复键
    #[error("Provider already registered for key '{key}' (strict registration)")]
    DuplicateRegistration { key: Key },

    /// 显式键为空字符串
    #[error("Provider key must be a non-empty string")]
    EmptyKey,

    /// 工厂执行失败，保留原始错误
    #[error("Provider '{key}' failed: {source}")]
    Factory {
        key: Key,
        #[source]
        source: BoxError,
    },

    /// 解析结果与请求的类型不符
    #[error("Resolved value for key '{key}' is not a {expected}")]
    TypeMismatch { key: Key, expected: &'static str },

    /// 对非单例提供者做单例播种或读取
    #[error("Provider '{key}' is not registered as a singleton")]
    NotSingleton { key: Key },

    #[error("Failed to read options file '{0}': {1}")]
    OptionsRead(String, #[source] std::io::Error),

    #[error("Failed to parse container options: {0}")]
    OptionsParse(#[from] toml::de::Error),
}

fn format_cycle(path: &[Key]) -> String {
    path.iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn requested_by_suffix(requested_by: &Option<Key>) -> String {
    match requested_by {
        Some(consumer) => format!(" (required by '{consumer}')"),
        None => String::new(),
    }
}
