//! 提供者键：注册表内的稳定标识符。
//!
//! 键要么由调用方显式给出，要么从工厂所在的模块路径与声明名推导，
//! 同一工厂重复注册总是得到相同的键，不同声明名不会冲突。

use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};

/// 注册表内唯一的提供者标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    /// 从模块路径与声明名推导键，形如 `my_app::db::pool`
    pub fn derived(module: &str, name: &str) -> Self {
        Key(Arc::from(format!("{module}::{name}")))
    }

    /// 校验显式键：空字符串拒绝
    pub fn explicit(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(Key(Arc::from(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        Key(Arc::from(raw))
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        Key(Arc::from(raw))
    }
}

impl From<&Key> for Key {
    fn from(key: &Key) -> Self {
        key.clone()
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// 在调用处按模块路径推导提供者键
#[macro_export]
macro_rules! provider_key {
    ($name:ident) => {
        $crate::key::Key::derived(module_path!(), stringify!($name))
    };
}
