//! 执行计划：拓扑排序的步骤快照与计划缓存。
//!
//! 计划在编译时把每个提供者的工厂、作用域与单例槽位快照进步骤表，
//! 依赖以更早步骤的下标表示。执行器只读计划，不再回查注册表。
//! 计划缓存按根键序列做 LRU，命中时校验注册表纪元，过期条目就地剔除。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::Result;
use crate::graph;
use crate::key::Key;
use crate::provider::{Factory, Scope};
use crate::registry::{RegistryView, Slot};

/// 单个执行步骤，依赖均指向下标更小的步骤
pub(crate) struct PlanStep {
    pub key: Key,
    pub factory: Factory,
    pub scope: Scope,
    pub slot: Option<Slot>,
    pub deps: Vec<usize>,
}

/// 编译完成的计划：步骤表、根下标、编译时纪元
pub(crate) struct Plan {
    pub steps: Vec<PlanStep>,
    pub roots: Vec<usize>,
    pub epoch: u64,
    /// 拓扑序中第一个异步工厂的键，同步执行据此快速失败
    pub first_async: Option<Key>,
}

pub(crate) fn compile(roots: &[Key], view: &RegistryView<'_>) -> Result<Plan> {
    let graph = graph::build(roots, view)?;
    let mut index_of: HashMap<Key, usize> = HashMap::with_capacity(graph.order.len());
    let mut steps: Vec<PlanStep> = Vec::with_capacity(graph.order.len());
    let mut first_async: Option<Key> = None;

    for (key, node) in graph.order {
        // 后序保证依赖步骤先于使用者入表
        let deps: Vec<usize> = node
            .record
            .dependencies
            .iter()
            .map(|dep| index_of[dep])
            .collect();
        if first_async.is_none() && node.record.factory.is_async() {
            first_async = Some(key.clone());
        }
        index_of.insert(key.clone(), steps.len());
        steps.push(PlanStep {
            key,
            factory: node.record.factory.clone(),
            scope: node.record.scope,
            slot: node.slot,
            deps,
        });
    }

    let root_indices: Vec<usize> = roots.iter().map(|root| index_of[root]).collect();
    tracing::debug!(
        roots = roots.len(),
        steps = steps.len(),
        epoch = view.epoch(),
        "编译执行计划"
    );

    Ok(Plan {
        steps,
        roots: root_indices,
        epoch: view.epoch(),
        first_async,
    })
}

impl Plan {
    pub(crate) fn export(&self) -> PlanExport {
        let steps: Vec<PlanStepExport> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| PlanStepExport {
                index,
                key: step.key.clone(),
                scope: step.scope,
                is_async: step.factory.is_async(),
                dependencies: step.deps.iter().map(|&i| self.steps[i].key.clone()).collect(),
            })
            .collect();
        PlanExport {
            roots: self.roots.iter().map(|&i| self.steps[i].key.clone()).collect(),
            epoch: self.epoch,
            steps,
        }
    }
}

/// 以根键序列为键的计划缓存，容量至少为 1
pub(crate) struct PlanCache {
    inner: Mutex<LruCache<Vec<Key>, Arc<Plan>>>,
}

impl PlanCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 命中且纪元一致才返回，过期条目顺手剔除
    pub(crate) fn get(&self, roots: &[Key], epoch: u64) -> Option<Arc<Plan>> {
        let mut cache = self.inner.lock();
        let plan = cache.get(roots)?.clone();
        if plan.epoch == epoch {
            Some(plan)
        } else {
            cache.pop(roots);
            None
        }
    }

    pub(crate) fn insert(&self, roots: Vec<Key>, plan: Arc<Plan>) {
        self.inner.lock().put(roots, plan);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// 可序列化的计划视图，供诊断与可视化
#[derive(Debug, Clone, Serialize)]
pub struct PlanExport {
    pub roots: Vec<Key>,
    pub epoch: u64,
    pub steps: Vec<PlanStepExport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStepExport {
    pub index: usize,
    pub key: Key,
    pub scope: Scope,
    pub is_async: bool,
    pub dependencies: Vec<Key>,
}

impl PlanExport {
    /// 生成 Graphviz DOT 文本，箭头指向被依赖方
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph ResolutionPlan {\n");
        dot.push_str("    rankdir=LR;\n");
        dot.push_str("    node [shape=box, style=filled];\n\n");

        for step in &self.steps {
            let fill = match step.scope {
                Scope::Singleton => "lightblue",
                Scope::Request => "lightyellow",
                Scope::Transient => "white",
            };
            let label = if step.is_async {
                format!("{} (async)", step.key)
            } else {
                step.key.to_string()
            };
            dot.push_str(&format!(
                "    \"{}\" [label=\"{}\", fillcolor={}];\n",
                escape_dot(step.key.as_str()),
                escape_dot(&label),
                fill
            ));
        }

        dot.push('\n');
        for step in &self.steps {
            for dep in &step.dependencies {
                dot.push_str(&format!(
                    "    \"{}\" -> \"{}\";\n",
                    escape_dot(step.key.as_str()),
                    escape_dot(dep.as_str())
                ));
            }
        }

        dot.push_str("}\n");
        dot
    }
}

fn escape_dot(text: &str) -> String {
    text.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderSpec;
    use crate::registry::Registry;

    fn registry_with_chain() -> Registry {
        let registry = Registry::new();
        registry
            .register(ProviderSpec::sync("c", |_| Ok(1u32)).into_record().unwrap(), false)
            .unwrap();
        registry
            .register(
                ProviderSpec::sync("b", |_| Ok(2u32))
                    .with_deps(["c"])
                    .into_record()
                    .unwrap(),
                false,
            )
            .unwrap();
        registry
            .register(
                ProviderSpec::sync("a", |_| Ok(3u32))
                    .with_deps(["b"])
                    .into_record()
                    .unwrap(),
                false,
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_compile_chain_snapshots_steps() {
        let registry = registry_with_chain();
        let plan = compile(&[Key::from("a")], &registry.view()).unwrap();

        let keys: Vec<&str> = plan.steps.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
        assert_eq!(plan.steps[2].deps, vec![1]);
        assert_eq!(plan.steps[1].deps, vec![0]);
        assert_eq!(plan.roots, vec![2]);
        assert!(plan.first_async.is_none());
    }

    #[test]
    fn test_compile_flags_first_async_in_topological_order() {
        let registry = Registry::new();
        registry
            .register(
                ProviderSpec::async_fn("dep", |_| async { Ok(1u32) })
                    .into_record()
                    .unwrap(),
                false,
            )
            .unwrap();
        registry
            .register(
                ProviderSpec::sync("top", |_| Ok(2u32))
                    .with_deps(["dep"])
                    .into_record()
                    .unwrap(),
                false,
            )
            .unwrap();

        let plan = compile(&[Key::from("top")], &registry.view()).unwrap();
        assert_eq!(plan.first_async.as_ref().unwrap().as_str(), "dep");
    }

    #[test]
    fn test_cache_hit_requires_matching_epoch() {
        let registry = registry_with_chain();
        let cache = PlanCache::new(8);
        let roots = vec![Key::from("a")];

        let plan = Arc::new(compile(&roots, &registry.view()).unwrap());
        cache.insert(roots.clone(), plan);
        assert!(cache.get(&roots, registry.epoch()).is_some());

        // 新注册使纪元前进，旧计划被惰性剔除
        registry
            .register(ProviderSpec::sync("d", |_| Ok(4u32)).into_record().unwrap(), false)
            .unwrap();
        assert!(cache.get(&roots, registry.epoch()).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let registry = registry_with_chain();
        let cache = PlanCache::new(1);
        let epoch = registry.epoch();

        let plan_a = Arc::new(compile(&[Key::from("a")], &registry.view()).unwrap());
        let plan_b = Arc::new(compile(&[Key::from("b")], &registry.view()).unwrap());
        cache.insert(vec![Key::from("a")], plan_a);
        cache.insert(vec![Key::from("b")], plan_b);

        assert!(cache.get(&[Key::from("a")], epoch).is_none());
        assert!(cache.get(&[Key::from("b")], epoch).is_some());
    }

    #[test]
    fn test_export_mirrors_plan_structure() {
        let registry = registry_with_chain();
        let plan = compile(&[Key::from("a")], &registry.view()).unwrap();
        let export = plan.export();

        assert_eq!(export.roots.len(), 1);
        assert_eq!(export.roots[0].as_str(), "a");
        assert_eq!(export.steps.len(), 3);
        assert_eq!(export.steps[2].dependencies[0].as_str(), "b");

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"key\":\"a\""));
        assert!(json.contains("\"scope\":\"transient\""));
    }

    #[test]
    fn test_dot_output_lists_nodes_and_edges() {
        let registry = registry_with_chain();
        let plan = compile(&[Key::from("a")], &registry.view()).unwrap();
        let dot = plan.export().to_dot();

        assert!(dot.starts_with("digraph ResolutionPlan {"));
        assert!(dot.contains("rankdir=LR"));
        assert!(dot.contains("\"a\" -> \"b\";"));
        assert!(dot.contains("\"b\" -> \"c\";"));
        assert!(dot.ends_with("}\n"));
    }
}
