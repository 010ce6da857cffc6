//! 请求作用域缓存。
//!
//! 每次进入 [`RequestScopes::enter`] 都会生成一个新的请求标识并写入
//! 任务局部变量，作用域内解析出的请求级值缓存在该请求专属的桶里。
//! 作用域结束（包括 panic 与取消）由守卫的 Drop 移除桶，不依赖弱引用。
//! 任务局部变量缺失时退回容器级兜底桶，兜底桶与容器同生命周期。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::key::Key;
use crate::provider::Svc;

tokio::task_local! {
    static CURRENT_REQUEST: RequestId;
}

/// 请求标识，进入作用域时分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestId(Uuid);

impl RequestId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

pub(crate) type Bucket = Arc<Mutex<HashMap<Key, Svc>>>;

pub(crate) struct RequestScopes {
    buckets: DashMap<RequestId, Bucket>,
    fallback: Bucket,
}

impl RequestScopes {
    pub(crate) fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            fallback: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 当前任务的请求桶；无活动请求时返回兜底桶
    pub(crate) fn current_bucket(&self) -> Bucket {
        match CURRENT_REQUEST.try_with(|id| *id) {
            Ok(id) => self
                .buckets
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(HashMap::new())))
                .clone(),
            Err(_) => self.fallback.clone(),
        }
    }

    /// 在新的请求作用域内运行 future，结束后释放该请求的桶
    pub(crate) async fn enter<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let id = RequestId::new();
        let _guard = BucketGuard { scopes: self, id };
        CURRENT_REQUEST.scope(id, fut).await
    }

    /// 从兜底桶与所有存活请求桶中移除指定键
    pub(crate) fn invalidate(&self, key: &Key) {
        self.fallback.lock().remove(key);
        for bucket in self.buckets.iter() {
            bucket.value().lock().remove(key);
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.buckets.len()
    }

    fn remove(&self, id: RequestId) {
        self.buckets.remove(&id);
    }
}

/// 作用域守卫：无论 future 正常结束、panic 还是被取消都会清理桶
struct BucketGuard<'a> {
    scopes: &'a RequestScopes,
    id: RequestId,
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        self.scopes.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_bucket_outside_scope() {
        let scopes = RequestScopes::new();
        let first = scopes.current_bucket();
        let second = scopes.current_bucket();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(scopes.active(), 0);
    }

    #[tokio::test]
    async fn test_scope_allocates_and_releases_bucket() {
        let scopes = RequestScopes::new();
        let fallback = scopes.current_bucket();

        let inside = scopes
            .enter(async {
                let bucket = scopes.current_bucket();
                bucket.lock().insert(Key::from("a"), Arc::new(1u32) as Svc);
                bucket
            })
            .await;

        assert!(!Arc::ptr_eq(&inside, &fallback));
        assert_eq!(scopes.active(), 0);
        assert!(fallback.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_scopes_get_distinct_buckets() {
        let scopes = RequestScopes::new();
        let first = scopes.enter(async { scopes.current_bucket() }).await;
        let second = scopes.enter(async { scopes.current_bucket() }).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_panic_inside_scope_still_releases_bucket() {
        let scopes = Arc::new(RequestScopes::new());
        let cloned = scopes.clone();
        let handle = tokio::spawn(async move {
            cloned
                .enter(async {
                    panic!("boom");
                })
                .await
        });

        assert!(handle.await.is_err());
        assert_eq!(scopes.active(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_clears_all_buckets() {
        let scopes = RequestScopes::new();
        let key = Key::from("svc");
        scopes
            .current_bucket()
            .lock()
            .insert(key.clone(), Arc::new(1u32) as Svc);

        scopes
            .enter(async {
                scopes
                    .current_bucket()
                    .lock()
                    .insert(key.clone(), Arc::new(2u32) as Svc);
                scopes.invalidate(&key);
                assert!(scopes.current_bucket().lock().is_empty());
            })
            .await;

        assert!(scopes.current_bucket().lock().is_empty());
    }
}
