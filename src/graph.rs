//! 依赖图构建与环检测。
//!
//! 从根键集合出发，对覆盖感知的注册表视图做显式栈上的深度优先
//! 遍历。结点着色 {未访问, 访问中, 完成}：子结点仍处于访问中即为
//! 环，报告完整环路径；查不到提供者的键报告缺失依赖及其需求方。
//! 遍历顺序只由根顺序与依赖声明顺序决定，与哈希表迭代无关。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::key::Key;
use crate::provider::ProviderRecord;
use crate::registry::{RegistryView, Slot};

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

pub(crate) struct GraphNode {
    pub record: Arc<ProviderRecord>,
    pub slot: Option<Slot>,
}

/// 构建结果：后序（依赖在前）排列的结点序列
pub(crate) struct Graph {
    pub order: Vec<(Key, GraphNode)>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&Key> = self.order.iter().map(|(key, _)| key).collect();
        f.debug_struct("Graph").field("order", &keys).finish()
    }
}

enum Frame {
    Visit(Key),
    Finish(Key, Arc<ProviderRecord>, Option<Slot>),
}

pub(crate) fn build(roots: &[Key], view: &RegistryView<'_>) -> Result<Graph> {
    let mut order: Vec<(Key, GraphNode)> = Vec::new();
    let mut state: HashMap<Key, VisitState> = HashMap::new();
    let mut path: Vec<Key> = Vec::new();

    for root in roots {
        if state.get(root) == Some(&VisitState::Done) {
            continue;
        }
        let mut stack: Vec<Frame> = vec![Frame::Visit(root.clone())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Finish(key, record, slot) => {
                    state.insert(key.clone(), VisitState::Done);
                    path.pop();
                    order.push((key, GraphNode { record, slot }));
                }
                Frame::Visit(key) => {
                    if state.contains_key(&key) {
                        // 经多个父结点重复入栈的结点此时已经完成
                        continue;
                    }
                    let requested_by = path.last().cloned();
                    let (record, slot) =
                        view.lookup(&key).ok_or_else(|| Error::UnresolvedDependency {
                            key: key.clone(),
                            requested_by,
                        })?;
                    state.insert(key.clone(), VisitState::InProgress);
                    path.push(key.clone());
                    stack.push(Frame::Finish(key, record.clone(), slot));
                    // 逆序入栈使依赖按声明顺序被发现
                    for dep in record.dependencies.iter().rev() {
                        match state.get(dep) {
                            Some(VisitState::InProgress) => {
                                return Err(cycle_error(&path, dep));
                            }
                            Some(VisitState::Done) => {}
                            None => stack.push(Frame::Visit(dep.clone())),
                        }
                    }
                }
            }
        }
    }

    Ok(Graph { order })
}

/// 从访问中路径截取环：自重复结点起到当前结点，再闭合回重复结点
fn cycle_error(path: &[Key], repeated: &Key) -> Error {
    let start = path.iter().position(|key| key == repeated).unwrap_or(0);
    let mut cycle: Vec<Key> = path[start..].to_vec();
    cycle.push(repeated.clone());
    Error::CycleDetected { path: cycle }
}
