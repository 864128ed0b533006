//! Registro de invokables: nombre -> fábrica. Reemplaza la carga dinámica
//! de código de usuario; el coordinador sólo manda el nombre y la config.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::builtins;
use crate::environment::TaskContext;
use crate::error::TaskError;

/// Unidad ejecutable de una tarea. Corre en su propio hilo bloqueante.
pub trait Invokable: Send {
    fn invoke(&mut self, ctx: &mut TaskContext) -> anyhow::Result<()>;
}

pub type InvokableFactory =
    Arc<dyn Fn(&Value) -> anyhow::Result<Box<dyn Invokable>> + Send + Sync>;

pub struct InvokableRegistry {
    factories: RwLock<HashMap<String, InvokableFactory>>,
}

impl InvokableRegistry {
    /// Registro vacío.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registro con los invokables que trae el runtime.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        builtins::register_all(&registry);
        registry
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn Invokable>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
        info!("invokable registrado: {}", name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instancia el invokable `name` con `config`. Nombre desconocido o
    /// config inválida son errores de despliegue.
    pub fn create(&self, name: &str, config: &Value) -> Result<Box<dyn Invokable>, TaskError> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::Deployment(format!("invokable desconocido: {}", name)))?;

        factory(config)
            .map_err(|e| TaskError::Deployment(format!("config inválida para {}: {:#}", name, e)))
    }
}

impl Default for InvokableRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl Invokable for Noop {
        fn invoke(&mut self, _ctx: &mut TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn builtins_are_available() {
        let r = InvokableRegistry::with_builtins();
        for name in [
            "sequence_source",
            "split_source",
            "forward",
            "file_sink",
            "discard_sink",
            "count_by_key",
        ] {
            assert!(r.contains(name), "{name}");
        }
    }

    #[test]
    fn unknown_name_is_a_deployment_error() {
        let r = InvokableRegistry::empty();
        assert!(matches!(
            r.create("nope", &json!({})),
            Err(TaskError::Deployment(_))
        ));
    }

    #[test]
    fn factory_errors_are_deployment_errors() {
        let r = InvokableRegistry::with_builtins();
        // file_sink necesita `path`
        let err = r.create("file_sink", &json!({})).err().unwrap();
        assert!(matches!(err, TaskError::Deployment(msg) if msg.contains("file_sink")));
    }

    #[test]
    fn custom_factories_can_be_registered() {
        let r = InvokableRegistry::empty();
        r.register("noop", |_| Ok(Box::new(Noop)));
        assert!(r.create("noop", &Value::Null).is_ok());
        assert_eq!(r.names(), vec!["noop".to_string()]);
    }
}
