//! 计划执行器。
//!
//! 沿步骤表顺序执行，依赖一定先于使用者完成，已解析值按下标存放，
//! 不做任何递归。同步执行前先检查计划内是否存在异步工厂，存在即
//! 失败，不运行任何工厂。单例首次构造按键串行化，缓存读取无锁争用。
//! 请求级缓存只在异步路径生效，同步路径对请求作用域既不读也不写。

use std::time::Instant;

use crate::container::InnerStats;
use crate::errors::{Error, Result};
use crate::hooks::{HookEvent, HookSet};
use crate::plan::{Plan, PlanStep};
use crate::provider::{Deps, Factory, Scope, Svc};
use crate::scope::Bucket;

/// 一次执行所需的环境：钩子、计数器与当前请求桶
pub(crate) struct ExecEnv<'a> {
    pub hooks: &'a HookSet,
    pub stats: &'a InnerStats,
    pub bucket: Bucket,
}

pub(crate) fn execute_sync(plan: &Plan, env: &ExecEnv<'_>) -> Result<Vec<Svc>> {
    if let Some(key) = &plan.first_async {
        return Err(Error::AsyncProviderInSyncPlan { key: key.clone() });
    }

    let mut resolved: Vec<Svc> = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let value = match step.scope {
            Scope::Singleton => resolve_singleton_sync(step, &resolved, env)?,
            Scope::Request | Scope::Transient => invoke_sync(step, &resolved, env)?,
        };
        resolved.push(value);
    }
    Ok(collect_roots(plan, &resolved))
}

pub(crate) async fn execute_async(plan: &Plan, env: &ExecEnv<'_>) -> Result<Vec<Svc>> {
    let mut resolved: Vec<Svc> = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let value = match step.scope {
            Scope::Singleton => resolve_singleton_async(step, &resolved, env).await?,
            Scope::Request => resolve_request_scoped(step, &resolved, env).await?,
            Scope::Transient => invoke_async(step, &resolved, env).await?,
        };
        resolved.push(value);
    }
    Ok(collect_roots(plan, &resolved))
}

fn collect_roots(plan: &Plan, resolved: &[Svc]) -> Vec<Svc> {
    plan.roots.iter().map(|&index| resolved[index].clone()).collect()
}

fn gather(step: &PlanStep, resolved: &[Svc]) -> Deps {
    Deps::new(step.deps.iter().map(|&index| resolved[index].clone()).collect())
}

fn resolve_singleton_sync(step: &PlanStep, resolved: &[Svc], env: &ExecEnv<'_>) -> Result<Svc> {
    let slot = match &step.slot {
        Some(slot) => slot,
        None => return invoke_sync(step, resolved, env),
    };
    if let Some(value) = slot.get() {
        record_cache_hit(step, env);
        return Ok(value);
    }
    // 首次构造按键串行，持锁后重查避免重复执行
    let _init = slot.blocking_lock_init();
    if let Some(value) = slot.get() {
        record_cache_hit(step, env);
        return Ok(value);
    }
    let value = invoke_sync(step, resolved, env)?;
    slot.set(value.clone());
    Ok(value)
}

async fn resolve_singleton_async(
    step: &PlanStep,
    resolved: &[Svc],
    env: &ExecEnv<'_>,
) -> Result<Svc> {
    let slot = match &step.slot {
        Some(slot) => slot,
        None => return invoke_async(step, resolved, env).await,
    };
    if let Some(value) = slot.get() {
        record_cache_hit(step, env);
        return Ok(value);
    }
    let _init = slot.lock_init().await;
    if let Some(value) = slot.get() {
        record_cache_hit(step, env);
        return Ok(value);
    }
    let value = invoke_async(step, resolved, env).await?;
    slot.set(value.clone());
    Ok(value)
}

async fn resolve_request_scoped(
    step: &PlanStep,
    resolved: &[Svc],
    env: &ExecEnv<'_>,
) -> Result<Svc> {
    // 桶锁不跨 await 持有
    let cached = env.bucket.lock().get(&step.key).cloned();
    if let Some(value) = cached {
        record_cache_hit(step, env);
        return Ok(value);
    }
    let value = invoke_async(step, resolved, env).await?;
    env.bucket.lock().insert(step.key.clone(), value.clone());
    Ok(value)
}

fn invoke_sync(step: &PlanStep, resolved: &[Svc], env: &ExecEnv<'_>) -> Result<Svc> {
    let deps = gather(step, resolved);
    let started = before_factory(step, false, env);
    let result = match &step.factory {
        Factory::Sync(factory) => factory(deps),
        // 编译时已拦截异步工厂，这里只是兜底
        Factory::Async(_) => {
            return Err(Error::AsyncProviderInSyncPlan {
                key: step.key.clone(),
            })
        }
    };
    finish_factory(step, false, started, result, env)
}

async fn invoke_async(step: &PlanStep, resolved: &[Svc], env: &ExecEnv<'_>) -> Result<Svc> {
    let deps = gather(step, resolved);
    let is_async = step.factory.is_async();
    let started = before_factory(step, is_async, env);
    let result = match &step.factory {
        Factory::Sync(factory) => factory(deps),
        Factory::Async(factory) => factory(deps).await,
    };
    finish_factory(step, is_async, started, result, env)
}

/// 有监听器才计时并发出事件
fn before_factory(step: &PlanStep, is_async: bool, env: &ExecEnv<'_>) -> Option<Instant> {
    if env.hooks.is_empty() {
        return None;
    }
    env.hooks.emit(&HookEvent::ProviderStart {
        key: step.key.clone(),
        is_async,
    });
    Some(Instant::now())
}

/// 工厂失败时不发 provider_end，错误带上提供者键
fn finish_factory(
    step: &PlanStep,
    is_async: bool,
    started: Option<Instant>,
    result: std::result::Result<Svc, crate::errors::BoxError>,
    env: &ExecEnv<'_>,
) -> Result<Svc> {
    let value = result.map_err(|source| Error::Factory {
        key: step.key.clone(),
        source,
    })?;
    if let Some(started) = started {
        env.hooks.emit(&HookEvent::ProviderEnd {
            key: step.key.clone(),
            is_async,
            duration_seconds: started.elapsed().as_secs_f64(),
        });
    }
    Ok(value)
}

fn record_cache_hit(step: &PlanStep, env: &ExecEnv<'_>) {
    match step.scope {
        Scope::Singleton => env.stats.record_singleton_hit(),
        Scope::Request => env.stats.record_request_hit(),
        Scope::Transient => {}
    }
    if !env.hooks.is_empty() {
        env.hooks.emit(&HookEvent::CacheHit {
            key: step.key.clone(),
            scope: step.scope,
        });
    }
}
