//! Demo processes served by the daemon.

use std::thread;
use std::time::Duration;

use engine::{BeanProcess, EngineError, ProcessFactoryRegistry};
use serde::{Deserialize, Serialize};

/// Build the registry with the demo bean types.
pub fn demo_registry() -> ProcessFactoryRegistry {
    let mut registry = ProcessFactoryRegistry::new();

    // Demo: Echo process
    registry.register_fn("echo", |ctx: &BeanProcess| {
        let bean = ctx.bean();
        tracing::info!("Echo bean {}: {}", bean.name, bean.payload);
        thread::sleep(Duration::from_secs(1));
        ctx.set_message(format!("Echo completed: {}", bean.payload))
    });

    // Demo: Sleep process, pausable between seconds
    registry.register_fn("sleep", |ctx: &BeanProcess| {
        let seconds = ctx
            .bean()
            .payload
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .max(1);
        tracing::info!("Sleeping for {} seconds", seconds);
        for second in 1..=seconds {
            ctx.check_paused()?;
            if ctx.is_final() {
                return Ok(());
            }
            thread::sleep(Duration::from_secs(1));
            ctx.set_progress(second as f64 * 100.0 / seconds as f64)?;
        }
        ctx.set_message(format!("Slept for {} seconds", seconds))
    });

    // Demo: Failing process
    registry.register_fn("fail", |ctx: &BeanProcess| {
        let should_fail = ctx
            .bean()
            .payload
            .get("fail")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if should_fail {
            Err(EngineError::Process("Intentional failure".into()))
        } else {
            ctx.set_message("Success")
        }
    });

    registry
}

/// Query asking every responder which bean types it can run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityQuery {
    pub id: String,
    #[serde(default)]
    pub bean_types: Vec<String>,
}

impl engine::Correlated for CapabilityQuery {
    fn correlation_id(&self) -> String {
        self.id.clone()
    }

    fn merge(&mut self, response: Self) {
        for bean_type in response.bean_types {
            if !self.bean_types.contains(&bean_type) {
                self.bean_types.push(bean_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use engine::Correlated;

    #[test]
    fn demo_types_are_registered() {
        let registry = demo_registry();
        for bean_type in ["echo", "sleep", "fail"] {
            assert!(registry.has_factory(bean_type));
        }
    }

    #[test]
    fn capability_answers_are_merged_without_duplicates() {
        let mut query = CapabilityQuery {
            id: "q".into(),
            bean_types: vec!["echo".into()],
        };
        query.merge(CapabilityQuery {
            id: "q".into(),
            bean_types: vec!["echo".into(), "sleep".into()],
        });
        assert_eq!(query.bean_types, vec!["echo", "sleep"]);
    }
}
