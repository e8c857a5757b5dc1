//! Event/hook pipeline with dependency injection.

mod event;
mod inject;
mod matcher;

pub use event::{
    CompletionEvent, CustomEvent, Event, EventKind, FallbackEvent, PreCompletionEvent,
};
pub use inject::{
    AnyValue, Dependency, HookArgs, HookValue, ParamSource, ParamSpec, ResolveContext,
    ResolvedArgs, hook_value,
};
pub use matcher::{Matcher, MatcherBuilder, MatcherRegistry, default_matchers};
