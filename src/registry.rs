//! Worker handler registration and lookup.
//!
//! Job payloads name their worker by a `class` string. Callers register a
//! handler per class; dispatch looks the handler up at execution time. A
//! class of the form `"Some.Worker/variant"` selects a method: the part
//! before the slash is the registry key and the remainder reaches the
//! handler through [`Invocation::method`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Everything a handler gets to see about the job it is performing.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub jid: String,
    pub queue: String,
    /// Registry key part of the class (selector stripped).
    pub class: String,
    /// Method selector, when the payload's class carried one.
    pub method: Option<String>,
    pub args: Vec<Value>,
    /// Failed attempts before this one.
    pub retry_count: u32,
}

/// A worker implementation for one class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, job: Invocation) -> anyhow::Result<()>;
}

type HandlerFn = Box<dyn Fn(Invocation) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct FnHandler(HandlerFn);

#[async_trait]
impl JobHandler for FnHandler {
    async fn perform(&self, job: Invocation) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}

/// Class-name → handler map shared by every pool of a manager.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a class name. Replaces any previous handler
    /// for the same class.
    pub fn register(&self, class: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let class = class.into();
        self.handlers.write().insert(class.clone(), handler);
        info!(class, "registered worker handler");
    }

    /// Register a plain async closure as the handler for a class.
    pub fn register_fn<F, Fut>(&self, class: impl Into<String>, f: F)
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let wrapped: HandlerFn = Box::new(move |job| Box::pin(f(job)));
        self.register(class, Arc::new(FnHandler(wrapped)));
    }

    /// Look up the handler for a payload class, ignoring any `/method`
    /// selector.
    pub fn resolve(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        let (key, _) = split_selector(class);
        self.handlers.read().get(key).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        let (key, _) = split_selector(class);
        self.handlers.read().contains_key(key)
    }

    /// Registered class names, unordered.
    pub fn classes(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

/// Split `"Class/method"` into the registry key and the optional selector.
pub fn split_selector(class: &str) -> (&str, Option<&str>) {
    match class.split_once('/') {
        Some((key, method)) if !method.is_empty() => (key, Some(method)),
        Some((key, _)) => (key, None),
        None => (class, None),
    }
}
