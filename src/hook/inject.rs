//! Dependency injection for hook handlers.
//!
//! A handler declares its parameters as a schema: each slot is filled from a
//! dependency factory, a caller-supplied keyword argument, or a positional
//! argument matched by runtime type. Factories for one handler resolve
//! concurrently; a factory returning `None` marks the value unavailable and
//! the handler is silently skipped.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::AmritaConfig;
use crate::error::AmritaError;

use super::event::Event;

/// Type-erased injected value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value for injection.
pub fn hook_value<T: Send + Sync + 'static>(value: T) -> HookValue {
    HookValue::Value(Arc::new(value))
}

/// A caller-supplied argument: either a ready value or a factory that is
/// resolved on demand.
#[derive(Clone)]
pub enum HookValue {
    Value(AnyValue),
    Factory(Dependency),
}

/// Positional and keyword arguments supplied to a dispatch.
#[derive(Clone, Default)]
pub struct HookArgs {
    pub args: Vec<HookValue>,
    pub kwargs: HashMap<String, HookValue>,
}

impl HookArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.args.push(hook_value(value));
        self
    }

    pub fn arg_factory(mut self, factory: Dependency) -> Self {
        self.args.push(HookValue::Factory(factory));
        self
    }

    pub fn kwarg<T: Send + Sync + 'static>(mut self, name: impl Into<String>, value: T) -> Self {
        self.kwargs.insert(name.into(), hook_value(value));
        self
    }

    pub fn kwarg_factory(mut self, name: impl Into<String>, factory: Dependency) -> Self {
        self.kwargs.insert(name.into(), HookValue::Factory(factory));
        self
    }
}

/// Context handed to dependency factories during resolution.
#[derive(Clone)]
pub struct ResolveContext {
    pub event: Event,
    pub config: AmritaConfig,
    pub args: Arc<HookArgs>,
    in_factory: bool,
}

impl ResolveContext {
    pub(crate) fn new(event: Event, config: AmritaConfig, args: Arc<HookArgs>) -> Self {
        Self {
            event,
            config,
            args,
            in_factory: false,
        }
    }

    /// A keyword argument by name, if it is a ready value of type `T`.
    pub fn kwarg<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        match self.args.kwargs.get(name)? {
            HookValue::Value(v) => v.clone().downcast::<T>().ok(),
            HookValue::Factory(_) => None,
        }
    }

    /// The first positional argument that is a ready value of type `T`.
    pub fn arg_of<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.args.args.iter().find_map(|value| match value {
            HookValue::Value(v) => v.clone().downcast::<T>().ok(),
            HookValue::Factory(_) => None,
        })
    }

    /// Resolve another dependency. Factories may not do this: a factory
    /// resolving a dependency of its own is the cycle the configuration
    /// rules forbid.
    pub async fn resolve_dependency(
        &self,
        dependency: &Dependency,
    ) -> Result<Option<AnyValue>, AmritaError> {
        if self.in_factory {
            return Err(AmritaError::Configuration(
                "a dependency factory may not itself resolve dependencies".to_string(),
            ));
        }
        dependency.resolve(self.clone()).await
    }
}

type FactoryFn =
    Arc<dyn Fn(ResolveContext) -> BoxFuture<'static, Result<Option<AnyValue>, AmritaError>> + Send + Sync>;

/// A dependency factory: produces a value injected into a handler slot.
///
/// Returning `Ok(None)` marks the dependency unavailable; the handler is
/// silently skipped.
#[derive(Clone)]
pub struct Dependency {
    factory: FactoryFn,
}

impl Dependency {
    pub fn new<F, Fut, T>(f: F) -> Self
    where
        F: Fn(ResolveContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<T>, AmritaError>> + Send + 'static,
        T: Send + Sync + 'static,
    {
        let factory: FactoryFn = Arc::new(move |ctx| {
            let fut = f(ctx);
            Box::pin(async move {
                Ok(fut.await?.map(|value| Arc::new(value) as AnyValue))
            })
        });
        Self { factory }
    }

    pub(crate) async fn resolve(&self, ctx: ResolveContext) -> Result<Option<AnyValue>, AmritaError> {
        let ctx = ResolveContext {
            in_factory: true,
            ..ctx
        };
        (self.factory)(ctx).await
    }
}

/// Where a handler parameter's value comes from.
#[derive(Clone)]
pub enum ParamSource {
    /// Resolved by a dependency factory.
    Depends(Dependency),
    /// Looked up in the caller's keyword arguments under the slot name.
    Kwarg,
    /// Bound to the first positional argument of the given runtime type.
    ArgByType(TypeId),
}

/// One declared handler parameter.
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub source: ParamSource,
}

impl ParamSpec {
    pub fn depends(name: impl Into<String>, dependency: Dependency) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Depends(dependency),
        }
    }

    pub fn kwarg(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Kwarg,
        }
    }

    pub fn arg_of<T: Send + Sync + 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::ArgByType(TypeId::of::<T>()),
        }
    }
}

/// Values bound to a handler's declared parameters.
#[derive(Clone, Default)]
pub struct ResolvedArgs {
    values: HashMap<String, AnyValue>,
}

impl ResolvedArgs {
    pub(crate) fn insert(&mut self, name: String, value: AnyValue) {
        self.values.insert(name, value);
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name)?.clone().downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::event::CustomEvent;

    fn test_event() -> Event {
        Event::Custom(Arc::new(CustomEvent::new(
            "test",
            serde_json::Value::Null,
            None,
        )))
    }

    #[tokio::test]
    async fn dependency_resolves_to_typed_value() {
        let dep = Dependency::new(|_ctx| async move { Ok(Some(7u32)) });
        let ctx = ResolveContext::new(
            test_event(),
            AmritaConfig::default(),
            Arc::new(HookArgs::new()),
        );
        let value = dep.resolve(ctx).await.unwrap().unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn factory_cannot_resolve_nested_dependency() {
        let inner = Dependency::new(|_ctx| async move { Ok(Some(1u32)) });
        let outer = Dependency::new(move |ctx: ResolveContext| {
            let inner = inner.clone();
            async move {
                let result = ctx.resolve_dependency(&inner).await;
                assert!(matches!(result, Err(AmritaError::Configuration(_))));
                Ok(Some(0u32))
            }
        });
        let ctx = ResolveContext::new(
            test_event(),
            AmritaConfig::default(),
            Arc::new(HookArgs::new()),
        );
        outer.resolve(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_context_exposes_kwargs_and_typed_args() {
        let args = HookArgs::new()
            .arg("positional".to_string())
            .kwarg("answer", 42u32);
        let ctx = ResolveContext::new(test_event(), AmritaConfig::default(), Arc::new(args));

        assert_eq!(*ctx.kwarg::<u32>("answer").unwrap(), 42);
        assert!(ctx.kwarg::<String>("answer").is_none());
        assert_eq!(*ctx.arg_of::<String>().unwrap(), "positional");
        assert!(ctx.arg_of::<u64>().is_none());
    }

    #[test]
    fn resolved_args_downcast_by_name() {
        let mut resolved = ResolvedArgs::default();
        resolved.insert("n".to_string(), Arc::new(5i64) as AnyValue);
        assert_eq!(*resolved.get::<i64>("n").unwrap(), 5);
        assert!(resolved.get::<u32>("n").is_none());
        assert!(resolved.get::<i64>("missing").is_none());
    }
}
