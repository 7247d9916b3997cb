//! Process factory registry and closure adapters.

use std::collections::HashMap;
use std::sync::Arc;

use queue_core::Bean;

use crate::error::{EngineError, EngineResult};
use crate::process::{BeanProcess, Process, ProcessFactory};
use crate::publisher::Publisher;

/// Routes beans to factories by `bean_type`.
#[derive(Default)]
pub struct ProcessFactoryRegistry {
    factories: HashMap<String, Arc<dyn ProcessFactory>>,
}

impl ProcessFactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for a bean type.
    pub fn register<F: ProcessFactory>(&mut self, bean_type: impl Into<String>, factory: F) {
        self.factories.insert(bean_type.into(), Arc::new(factory));
    }

    /// Register a closure that runs as the process body for a bean type.
    pub fn register_fn<F>(&mut self, bean_type: impl Into<String>, body: F)
    where
        F: Fn(&BeanProcess) -> EngineResult<()> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        self.register(
            bean_type,
            FnFactory::new(move |_bean: &Bean| Ok(FnProcess::shared(body.clone()))),
        );
    }

    /// Get the factory for a bean type.
    pub fn get(&self, bean_type: &str) -> Option<Arc<dyn ProcessFactory>> {
        self.factories.get(bean_type).cloned()
    }

    /// Check if a factory exists for a bean type.
    pub fn has_factory(&self, bean_type: &str) -> bool {
        self.factories.contains_key(bean_type)
    }

    /// List all registered bean types.
    pub fn bean_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl ProcessFactory for ProcessFactoryRegistry {
    fn create_process(
        &self,
        bean: &Bean,
        publisher: &Arc<dyn Publisher>,
    ) -> EngineResult<Box<dyn Process>> {
        match self.factories.get(&bean.bean_type) {
            Some(factory) => factory.create_process(bean, publisher),
            None => Err(EngineError::Process(format!(
                "No process factory for bean type: {}",
                bean.bean_type
            ))),
        }
    }
}

/// A factory backed by a closure.
pub struct FnFactory<F, P>
where
    F: Fn(&Bean) -> EngineResult<P> + Send + Sync + 'static,
    P: Process,
{
    build: F,
}

impl<F, P> FnFactory<F, P>
where
    F: Fn(&Bean) -> EngineResult<P> + Send + Sync + 'static,
    P: Process,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F, P> ProcessFactory for FnFactory<F, P>
where
    F: Fn(&Bean) -> EngineResult<P> + Send + Sync + 'static,
    P: Process,
{
    fn create_process(
        &self,
        bean: &Bean,
        _publisher: &Arc<dyn Publisher>,
    ) -> EngineResult<Box<dyn Process>> {
        Ok(Box::new((self.build)(bean)?))
    }
}

type ProcessBody = dyn Fn(&BeanProcess) -> EngineResult<()> + Send + Sync;

/// A process whose body is a closure.
pub struct FnProcess {
    body: Arc<ProcessBody>,
    blocking: Option<bool>,
}

impl FnProcess {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&BeanProcess) -> EngineResult<()> + Send + Sync + 'static,
    {
        Self::shared(Arc::new(body))
    }

    fn shared(body: Arc<ProcessBody>) -> Self {
        Self {
            body,
            blocking: None,
        }
    }

    /// Force the process onto (or off) the consumer thread.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = Some(blocking);
        self
    }
}

impl Process for FnProcess {
    fn execute(&self, ctx: &BeanProcess) -> EngineResult<()> {
        (self.body)(ctx)
    }

    fn blocking(&self) -> Option<bool> {
        self.blocking
    }
}
