//! 容器配置。
//!
//! 选项可以直接用 `Default` 构造，也可以从 TOML 文本或文件载入，
//! 缺省字段走各自的默认值。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// 容器行为选项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// 严格注册：重复键直接报错而不是后写覆盖
    #[serde(default)]
    pub strict_registration: bool,
    /// 计划缓存容量，低于 1 时按 1 处理
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: usize,
}

fn default_plan_cache_capacity() -> usize {
    128
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            strict_registration: false,
            plan_cache_capacity: default_plan_cache_capacity(),
        }
    }
}

/// 运行计数快照，由 `Container::stats` 生成
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStats {
    pub resolutions: usize,
    pub singleton_hits: usize,
    pub request_hits: usize,
    pub plans_compiled: usize,
    pub plan_cache_hits: usize,
    pub registrations: usize,
}

impl ContainerOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::OptionsRead(path.display().to_string(), err))?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn normalized_capacity(&self) -> usize {
        self.plan_cache_capacity.max(1)
    }
}
