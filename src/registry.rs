use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{error, info};

use crate::{
    descriptor::{DebugConfig, FunctionDescriptor, FunctionKey},
    lifecycle::{mode_for, InvocationLifecycle, LifecycleContext},
};

/// Lifecycles keyed by `(service, function)`.
pub struct LifecycleRegistry {
    ctx: Arc<LifecycleContext>,
    lifecycles: DashMap<FunctionKey, Arc<InvocationLifecycle>>,
}

impl LifecycleRegistry {
    pub fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self {
            ctx,
            lifecycles: DashMap::new(),
        }
    }

    pub fn get(&self, key: &FunctionKey) -> Option<Arc<InvocationLifecycle>> {
        self.lifecycles.get(key).map(|entry| entry.value().clone())
    }

    /// Lifecycle for a function, created on first use. Concurrent callers
    /// for the same key get the same instance.
    pub fn get_or_create(
        &self,
        descriptor: Arc<FunctionDescriptor>,
        eager: bool,
        debug: Option<DebugConfig>,
    ) -> Arc<InvocationLifecycle> {
        self.lifecycles
            .entry(descriptor.key())
            .or_insert_with(|| {
                let mode = mode_for(&descriptor);
                info!(
                    service = %descriptor.service,
                    function = %descriptor.name,
                    mode = ?mode,
                    eager,
                    "Registered function"
                );
                Arc::new(InvocationLifecycle::new(
                    descriptor.clone(),
                    mode,
                    eager,
                    debug,
                    self.ctx.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub fn keys(&self) -> Vec<FunctionKey> {
        let mut keys: Vec<FunctionKey> = self.lifecycles.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lifecycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lifecycles.is_empty()
    }

    /// Initialize every eager lifecycle. Failures are logged; the lifecycle
    /// retries on its first request.
    pub async fn init_eager(&self) {
        let eager: Vec<Arc<InvocationLifecycle>> = self
            .lifecycles
            .iter()
            .filter(|e| e.value().is_eager())
            .map(|e| e.value().clone())
            .collect();

        let results = join_all(eager.iter().map(|lifecycle| lifecycle.init())).await;
        for (lifecycle, result) in eager.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    function = %lifecycle.key(),
                    error = %e,
                    "Eager initialization failed, will retry on first request"
                );
            }
        }
    }

    pub async fn terminate_all(&self) {
        let lifecycles: Vec<Arc<InvocationLifecycle>> =
            self.lifecycles.iter().map(|e| e.value().clone()).collect();
        join_all(lifecycles.iter().map(|lifecycle| lifecycle.terminate())).await;
        info!(count = lifecycles.len(), "Terminated all functions");
    }
}
