#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use engine::{
    BeanProcess, Consumer, ConsumerConfig, EngineError, InMemoryTransport, ProcessFactoryRegistry,
};
use queue_core::{Bean, BeanId, Status};

/// Process body that counts to 100, checking for pause between steps.
pub fn stepping(step: Duration) -> impl Fn(&BeanProcess) -> Result<(), EngineError> + Send + Sync {
    move |ctx| {
        for i in 1..=10 {
            ctx.check_paused()?;
            if ctx.is_final() {
                return Ok(());
            }
            thread::sleep(step);
            ctx.set_progress(f64::from(i) * 10.0)?;
        }
        Ok(())
    }
}

pub fn registry() -> ProcessFactoryRegistry {
    let mut registry = ProcessFactoryRegistry::new();
    registry.register_fn("echo", |_ctx| Ok(()));
    registry.register_fn("step", stepping(Duration::from_millis(20)));
    registry.register_fn("fail", |_ctx| Err(EngineError::Process("detector offline".into())));
    registry
}

pub fn consumer(config: ConsumerConfig, transport: Arc<InMemoryTransport>) -> Consumer {
    Consumer::builder(config, Arc::new(registry()), transport)
        .build()
        .unwrap()
}

/// Poll until the bean reaches `status`.
pub fn wait_for(consumer: &Consumer, id: BeanId, status: Status) -> Bean {
    for _ in 0..1000 {
        if let Some(bean) = consumer.queue().get(id)
            && bean.status == status
        {
            return bean;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("bean {id} never reached {status}");
}

/// Poll until the bean has a live process.
pub fn wait_for_process(consumer: &Consumer, id: BeanId) -> Arc<BeanProcess> {
    for _ in 0..1000 {
        if let Some(process) = consumer.process(id) {
            return process;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("bean {id} never started");
}
