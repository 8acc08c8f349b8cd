//! Registry of live isolates keyed by id

use crate::error::{Result, SandboxError};
use crate::platform::{Invocation, InvocationReply, IsolateConfig, IsolateInstance, IsolationPlatform};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Cheap, cloneable handle to a live isolate
#[derive(Clone)]
pub struct IsolateHandle {
    id: String,
    instance: Arc<dyn IsolateInstance>,
}

impl IsolateHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn invoke(&self, invocation: Invocation) -> Result<InvocationReply> {
        self.instance.invoke(invocation).await
    }

    /// Whether two handles refer to the same isolate
    pub fn same_isolate(&self, other: &IsolateHandle) -> bool {
        Arc::ptr_eq(&self.instance, &other.instance)
    }
}

impl std::fmt::Debug for IsolateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A registered isolate
#[derive(Debug, Clone)]
pub struct IsolateEntry {
    pub id: String,
    pub handle: IsolateHandle,
    pub loaded_at: DateTime<Utc>,
}

type Slot = Arc<OnceCell<IsolateEntry>>;

/// Owns every live isolate.
///
/// Loading is idempotent per id: concurrent loads of one id share a single
/// platform call, and once loaded the config of later loads is ignored.
pub struct IsolateRegistry {
    platform: Option<Arc<dyn IsolationPlatform>>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl IsolateRegistry {
    pub fn new(platform: Option<Arc<dyn IsolationPlatform>>) -> Self {
        Self {
            platform,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn has_platform(&self) -> bool {
        self.platform.is_some()
    }

    pub fn platform_name(&self) -> Option<&str> {
        self.platform.as_deref().map(|p| p.name())
    }

    /// Load (or reuse) the isolate for `id`
    pub async fn load(&self, id: &str, config: IsolateConfig) -> Result<IsolateHandle> {
        self.load_with(id, move || config).await
    }

    /// Load (or reuse) the isolate for `id`, building its config only on a miss
    pub async fn load_with<F>(&self, id: &str, factory: F) -> Result<IsolateHandle>
    where
        F: FnOnce() -> IsolateConfig + Send + 'static,
    {
        let platform = self
            .platform
            .clone()
            .ok_or(SandboxError::IsolationUnavailable)?;

        let slot = {
            let mut slots = self.slots.write().await;
            slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let loaded = slot
            .get_or_try_init(|| async move {
                tracing::debug!(isolate_id = %id, platform = platform.name(), "Loading isolate");
                let instance = platform.get(id, Box::new(factory)).await?;
                Ok::<_, SandboxError>(IsolateEntry {
                    id: id.to_string(),
                    handle: IsolateHandle {
                        id: id.to_string(),
                        instance,
                    },
                    loaded_at: Utc::now(),
                })
            })
            .await;

        match loaded {
            Ok(entry) => Ok(entry.handle.clone()),
            Err(e) => {
                self.discard_failed_slot(id, &slot).await;
                Err(e)
            }
        }
    }

    /// Forget an empty slot left by a failed load, unless it was already replaced
    async fn discard_failed_slot(&self, id: &str, slot: &Slot) {
        let mut slots = self.slots.write().await;
        let stale = slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized());
        if stale {
            slots.remove(id);
            tracing::debug!(isolate_id = %id, "Discarded slot of failed load");
        }
    }

    /// Handle for a loaded isolate
    pub async fn get(&self, id: &str) -> Option<IsolateHandle> {
        let slots = self.slots.read().await;
        slots
            .get(id)
            .and_then(|slot| slot.get())
            .map(|entry| entry.handle.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    /// Invoke a loaded isolate
    pub async fn execute(&self, id: &str, invocation: Invocation) -> Result<InvocationReply> {
        let handle = self
            .get(id)
            .await
            .ok_or_else(|| SandboxError::NotLoaded(id.to_string()))?;
        handle.invoke(invocation).await
    }

    /// Drop the isolate for `id`; returns whether one was loaded
    pub async fn unload(&self, id: &str) -> bool {
        let removed = self.slots.write().await.remove(id);
        let was_loaded = removed.is_some_and(|slot| slot.initialized());
        if was_loaded {
            tracing::debug!(isolate_id = %id, "Unloaded isolate");
        }
        was_loaded
    }

    /// Drop every isolate; returns how many were loaded
    pub async fn unload_all(&self) -> usize {
        let drained: Vec<Slot> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        let count = drained.iter().filter(|slot| slot.initialized()).count();
        tracing::debug!(count, "Unloaded all isolates");
        count
    }

    /// Snapshot of loaded isolates, oldest first
    pub async fn entries(&self) -> Vec<IsolateEntry> {
        let slots = self.slots.read().await;
        let mut entries: Vec<IsolateEntry> = slots.values().filter_map(|s| s.get().cloned()).collect();
        entries.sort_by_key(|entry| entry.loaded_at);
        entries
    }

    pub async fn len(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for IsolateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateRegistry")
            .field("platform", &self.platform_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ConfigFactory;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl IsolateInstance for Echo {
        async fn invoke(&self, invocation: Invocation) -> Result<InvocationReply> {
            match invocation {
                Invocation::Method { name, .. } => Ok(InvocationReply::Value(Value::String(name))),
                Invocation::Request(_) => Ok(InvocationReply::Value(Value::Null)),
            }
        }
    }

    #[derive(Default)]
    struct CountingPlatform {
        loads: AtomicUsize,
        factories_run: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IsolationPlatform for CountingPlatform {
        async fn get(&self, _id: &str, factory: ConfigFactory) -> Result<Arc<dyn IsolateInstance>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let _config = factory();
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Arc::new(Echo))
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn registry() -> (IsolateRegistry, Arc<CountingPlatform>) {
        let platform = Arc::new(CountingPlatform::default());
        (IsolateRegistry::new(Some(platform.clone())), platform)
    }

    fn config() -> IsolateConfig {
        IsolateConfig::new("main.js", "({})")
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (registry, platform) = registry();
        let a = registry.load("w1", config()).await.unwrap();
        let b = registry.load("w1", config()).await.unwrap();
        assert!(a.same_isolate(&b));
        assert_eq!(platform.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_platform_call() {
        let (registry, platform) = registry();
        let registry = Arc::new(registry);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.load("shared", config()).await.unwrap() })
            })
            .collect();
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        assert!(handles.windows(2).all(|w| w[0].same_isolate(&w[1])));
        assert_eq!(platform.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_skipped_on_hit() {
        let (registry, platform) = registry();
        registry.load("w", config()).await.unwrap();
        let counter = platform.factories_run.clone();
        registry
            .load_with("w", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                config()
            })
            .await
            .unwrap();
        assert_eq!(platform.factories_run.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_after_unload_is_not_loaded() {
        let (registry, _) = registry();
        registry.load("w", config()).await.unwrap();
        let reply = registry
            .execute("w", Invocation::method("ping", vec![]))
            .await
            .unwrap();
        assert_eq!(reply, InvocationReply::Value(json!("ping")));

        assert!(registry.unload("w").await);
        assert!(!registry.unload("w").await);
        let err = registry
            .execute("w", Invocation::method("ping", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NotLoaded(id) if id == "w"));
    }

    #[tokio::test]
    async fn test_missing_platform() {
        let registry = IsolateRegistry::new(None);
        let err = registry.load("w", config()).await.unwrap_err();
        assert!(matches!(err, SandboxError::IsolationUnavailable));
    }

    #[tokio::test]
    async fn test_unload_all_and_entries() {
        let (registry, _) = registry();
        registry.load("a", config()).await.unwrap();
        registry.load("b", config()).await.unwrap();
        let ids: Vec<String> = registry.entries().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(registry.unload_all().await, 2);
        assert!(registry.is_empty().await);
    }

    /// Fails the first `failures` loads
    struct FlakyPlatform {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl IsolationPlatform for FlakyPlatform {
        async fn get(&self, id: &str, _factory: ConfigFactory) -> Result<Arc<dyn IsolateInstance>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SandboxError::Platform(format!("cannot start {}", id)));
            }
            Ok(Arc::new(Echo))
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_load_leaves_no_slot() {
        let platform = Arc::new(FlakyPlatform {
            failures: AtomicUsize::new(1),
        });
        let registry = IsolateRegistry::new(Some(platform));

        let err = registry.load("w", config()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Platform(_)));
        assert!(registry.slots.read().await.is_empty());
        assert!(!registry.unload("w").await);

        registry.load("w", config()).await.unwrap();
        assert!(registry.contains("w").await);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_replacement_slot() {
        let (registry, _) = registry();
        let stale: Slot = Arc::new(OnceCell::new());
        registry.load("w", config()).await.unwrap();

        registry.discard_failed_slot("w", &stale).await;
        assert!(registry.contains("w").await);
    }
}
