//! Matcher registration and event dispatch.
//!
//! Matchers for one event kind fire in registration order and handlers run
//! sequentially; only the dependency factories of a single handler resolve
//! in parallel.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use futures::future::{BoxFuture, join_all};
use tracing::{debug, error, warn};

use crate::config::AmritaConfig;
use crate::error::{AmritaError, ErrorKind};

use super::event::{Event, EventKind};
use super::inject::{
    AnyValue, HookArgs, HookValue, ParamSource, ParamSpec, ResolveContext, ResolvedArgs,
};

type HandlerFn =
    Arc<dyn Fn(Event, ResolvedArgs) -> BoxFuture<'static, Result<(), AmritaError>> + Send + Sync>;

/// A registered event handler with its parameter schema.
pub struct Matcher {
    pub name: String,
    pub kind: EventKind,
    params: Vec<ParamSpec>,
    handler: HandlerFn,
}

/// Event-kind → ordered matcher list.
#[derive(Default)]
pub struct MatcherRegistry {
    inner: RwLock<HashMap<EventKind, Vec<Arc<Matcher>>>>,
}

static DEFAULT_MATCHERS: LazyLock<Arc<MatcherRegistry>> =
    LazyLock::new(|| Arc::new(MatcherRegistry::new()));

/// The process-wide matcher registry.
pub fn default_matchers() -> Arc<MatcherRegistry> {
    DEFAULT_MATCHERS.clone()
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start registering a matcher for the given event kind.
    pub fn on_event(&self, kind: EventKind, name: impl Into<String>) -> MatcherBuilder<'_> {
        MatcherBuilder {
            registry: self,
            kind,
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn on_pre_completion(&self, name: impl Into<String>) -> MatcherBuilder<'_> {
        self.on_event(EventKind::PreCompletion, name)
    }

    pub fn on_completion(&self, name: impl Into<String>) -> MatcherBuilder<'_> {
        self.on_event(EventKind::Completion, name)
    }

    pub fn on_preset_fallback(&self, name: impl Into<String>) -> MatcherBuilder<'_> {
        self.on_event(EventKind::Fallback, name)
    }

    fn register(&self, matcher: Matcher) {
        let mut inner = self.inner.write().expect("matcher registry lock poisoned");
        inner
            .entry(matcher.kind.clone())
            .or_default()
            .push(Arc::new(matcher));
    }

    pub fn matcher_count(&self, kind: &EventKind) -> usize {
        let inner = self.inner.read().expect("matcher registry lock poisoned");
        inner.get(kind).map_or(0, Vec::len)
    }

    /// Dispatch an event through all matchers registered for its kind.
    ///
    /// Returns the dependency-resolution aggregates of skipped handlers.
    /// Errors whose kind appears in `exception_ignored` are re-raised to the
    /// caller instead.
    pub async fn trigger_event(
        &self,
        event: &Event,
        config: &AmritaConfig,
        hook_args: &HookArgs,
        exception_ignored: &[ErrorKind],
    ) -> Result<Vec<AmritaError>, AmritaError> {
        let matchers: Vec<Arc<Matcher>> = {
            let inner = self.inner.read().expect("matcher registry lock poisoned");
            inner.get(&event.kind()).cloned().unwrap_or_default()
        };

        if matchers.is_empty() {
            debug!(kind = ?event.kind(), "no matchers registered for event");
            return Ok(Vec::new());
        }

        let args = Arc::new(hook_args.clone());
        let mut aggregates = Vec::new();

        for matcher in matchers {
            let ctx = ResolveContext::new(event.clone(), config.clone(), args.clone());
            match bind_params(&matcher, ctx, exception_ignored).await? {
                Binding::Skip(reason) => {
                    debug!(matcher = %matcher.name, reason = %reason, "matcher skipped");
                }
                Binding::Failed(aggregate) => {
                    warn!(
                        matcher = %matcher.name,
                        error = %aggregate,
                        "dependency resolution failed, matcher skipped"
                    );
                    aggregates.push(aggregate);
                }
                Binding::Bound(resolved) => {
                    debug!(matcher = %matcher.name, "running matcher");
                    match (matcher.handler)(event.clone(), resolved).await {
                        Ok(()) => {}
                        Err(e) if exception_ignored.contains(&e.kind()) => return Err(e),
                        Err(e) => {
                            error!(matcher = %matcher.name, error = %e, "matcher handler failed");
                        }
                    }
                }
            }
        }

        Ok(aggregates)
    }
}

/// Fluent matcher registration.
pub struct MatcherBuilder<'a> {
    registry: &'a MatcherRegistry,
    kind: EventKind,
    name: String,
    params: Vec<ParamSpec>,
}

impl MatcherBuilder<'_> {
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Finish registration with the handler body.
    pub fn handler<F, Fut>(self, f: F)
    where
        F: Fn(Event, ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), AmritaError>> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |event, resolved| Box::pin(f(event, resolved)));
        self.registry.register(Matcher {
            name: self.name,
            kind: self.kind,
            params: self.params,
            handler,
        });
    }
}

enum Binding {
    Bound(ResolvedArgs),
    Skip(String),
    Failed(AmritaError),
}

enum Slot {
    Param(String),
    Positional(usize),
}

/// Resolve a matcher's parameter schema against the dispatch context.
async fn bind_params(
    matcher: &Matcher,
    ctx: ResolveContext,
    exception_ignored: &[ErrorKind],
) -> Result<Binding, AmritaError> {
    let mut resolved = ResolvedArgs::default();
    let mut pending: Vec<(Slot, super::inject::Dependency)> = Vec::new();
    let mut by_type: Vec<(String, std::any::TypeId)> = Vec::new();

    for param in &matcher.params {
        match &param.source {
            ParamSource::Depends(dep) => {
                pending.push((Slot::Param(param.name.clone()), dep.clone()));
            }
            ParamSource::Kwarg => match ctx.args.kwargs.get(&param.name) {
                None => {
                    return Ok(Binding::Skip(format!(
                        "keyword argument {} not supplied",
                        param.name
                    )));
                }
                Some(HookValue::Value(v)) => resolved.insert(param.name.clone(), v.clone()),
                Some(HookValue::Factory(dep)) => {
                    pending.push((Slot::Param(param.name.clone()), dep.clone()));
                }
            },
            ParamSource::ArgByType(tid) => by_type.push((param.name.clone(), *tid)),
        }
    }

    // Positional factories resolve up front so by-type binding sees their
    // produced values.
    let mut positional: Vec<Option<AnyValue>> = Vec::with_capacity(ctx.args.args.len() + 1);
    positional.push(Some(Arc::new(ctx.config.clone()) as AnyValue));
    for (i, value) in ctx.args.args.iter().enumerate() {
        match value {
            HookValue::Value(v) => positional.push(Some(v.clone())),
            HookValue::Factory(dep) => {
                if by_type.is_empty() {
                    positional.push(None);
                } else {
                    positional.push(None);
                    pending.push((Slot::Positional(i + 1), dep.clone()));
                }
            }
        }
    }

    if !pending.is_empty() {
        let futures = pending
            .iter()
            .map(|(_, dep)| dep.resolve(ctx.clone()))
            .collect::<Vec<_>>();
        let results = join_all(futures).await;

        let mut failures = Vec::new();
        for ((slot, _), result) in pending.into_iter().zip(results) {
            match result {
                Err(e) if exception_ignored.contains(&e.kind()) => return Err(e),
                Err(e) => failures.push(e.to_string()),
                Ok(None) => {
                    return Ok(Binding::Skip("dependency unavailable".to_string()));
                }
                Ok(Some(value)) => match slot {
                    Slot::Param(name) => resolved.insert(name, value),
                    Slot::Positional(index) => positional[index] = Some(value),
                },
            }
        }
        if !failures.is_empty() {
            return Ok(Binding::Failed(AmritaError::DependencyResolution(failures)));
        }
    }

    // Bind remaining parameters by runtime type against the positional pool
    // (the dispatch config is implicitly the first pool entry).
    let mut used = vec![false; positional.len()];
    for (name, tid) in by_type {
        let found = positional.iter().enumerate().find_map(|(i, value)| {
            let value = value.as_ref()?;
            (!used[i] && value.as_ref().type_id() == tid).then(|| (i, value.clone()))
        });
        match found {
            Some((i, value)) => {
                used[i] = true;
                resolved.insert(name, value);
            }
            None => {
                return Ok(Binding::Skip(format!(
                    "no positional argument matches the type of {name}"
                )));
            }
        }
    }

    Ok(Binding::Bound(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::event::CustomEvent;
    use crate::hook::inject::Dependency;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn custom_event(name: &str) -> Event {
        Event::Custom(Arc::new(CustomEvent::new(
            name,
            serde_json::Value::Null,
            None,
        )))
    }

    #[tokio::test]
    async fn matchers_fire_in_registration_order() {
        let registry = MatcherRegistry::new();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            registry
                .on_event(EventKind::custom("tick"), label)
                .handler(move |_event, _args| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        Ok(())
                    }
                });
        }

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn missing_kwarg_skips_handler() {
        let registry = MatcherRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        registry
            .on_event(EventKind::custom("tick"), "needs_kwarg")
            .param(ParamSpec::kwarg("user"))
            .handler(move |_event, _args| {
                let fired = fired_clone.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new().kwarg("user", "alice".to_string()),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn positional_args_bind_by_type() {
        let registry = MatcherRegistry::new();
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        registry
            .on_event(EventKind::custom("tick"), "typed")
            .param(ParamSpec::arg_of::<String>("label"))
            .param(ParamSpec::arg_of::<AmritaConfig>("config"))
            .handler(move |_event, args| {
                let seen = seen_clone.clone();
                async move {
                    let label = args.get::<String>("label").unwrap();
                    assert!(args.get::<AmritaConfig>("config").is_some());
                    *seen.lock().unwrap() = Some((*label).clone());
                    Ok(())
                }
            });

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new().arg(12u8).arg("bound".to_string()),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("bound"));
    }

    #[tokio::test]
    async fn unavailable_dependency_silently_skips() {
        let registry = MatcherRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        registry
            .on_event(EventKind::custom("tick"), "gated")
            .param(ParamSpec::depends(
                "dep",
                Dependency::new(|_ctx| async move { Ok(None::<u32>) }),
            ))
            .handler(move |_event, _args| {
                let fired = fired_clone.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        let aggregates = registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(aggregates.is_empty());
    }

    #[tokio::test]
    async fn factory_errors_aggregate_and_skip_handler() {
        let registry = MatcherRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        registry
            .on_event(EventKind::custom("tick"), "faulty")
            .param(ParamSpec::depends(
                "a",
                Dependency::new(|_ctx| async move {
                    Err::<Option<u32>, _>(AmritaError::Configuration("factory a broke".into()))
                }),
            ))
            .param(ParamSpec::depends(
                "b",
                Dependency::new(|_ctx| async move {
                    Err::<Option<u32>, _>(AmritaError::Configuration("factory b broke".into()))
                }),
            ))
            .handler(move |_event, _args| {
                let fired = fired_clone.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        let aggregates = registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(aggregates.len(), 1);
        match &aggregates[0] {
            AmritaError::DependencyResolution(messages) => assert_eq!(messages.len(), 2),
            other => panic!("expected aggregate, got {other}"),
        }
    }

    #[tokio::test]
    async fn ignored_factory_errors_are_reraised() {
        let registry = MatcherRegistry::new();

        registry
            .on_event(EventKind::custom("tick"), "raising")
            .param(ParamSpec::depends(
                "dep",
                Dependency::new(|_ctx| async move {
                    Err::<Option<u32>, _>(AmritaError::QueueClosed)
                }),
            ))
            .handler(|_event, _args| async move { Ok(()) });

        let result = registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[ErrorKind::QueueClosed],
            )
            .await;

        assert!(matches!(result, Err(AmritaError::QueueClosed)));
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_later_matchers() {
        let registry = MatcherRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        registry
            .on_event(EventKind::custom("tick"), "broken")
            .handler(|_event, _args| async move {
                Err(AmritaError::Configuration("handler broke".into()))
            });

        let fired_clone = fired.clone();
        registry
            .on_event(EventKind::custom("tick"), "after")
            .handler(move |_event, _args| {
                let fired = fired_clone.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new(),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn kwarg_factories_are_unwrapped() {
        let registry = MatcherRegistry::new();
        let seen: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        registry
            .on_event(EventKind::custom("tick"), "kwarg_factory")
            .param(ParamSpec::kwarg("count"))
            .handler(move |_event, args| {
                let seen = seen_clone.clone();
                async move {
                    *seen.lock().unwrap() = args.get::<u32>("count").map(|v| *v);
                    Ok(())
                }
            });

        registry
            .trigger_event(
                &custom_event("tick"),
                &AmritaConfig::default(),
                &HookArgs::new().kwarg_factory(
                    "count",
                    Dependency::new(|_ctx| async move { Ok(Some(9u32)) }),
                ),
                &[],
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(9));
    }
}
