// ABOUTME: Listener engine for aviso: schema-driven listeners, trigger dispatch and the manager running them.
// ABOUTME: Also hosts the publish path that writes notifications the listeners pick up.

pub mod listener;
pub mod manager;
pub mod publish;
pub mod trigger;

pub use listener::{
    EventListener, ListenerConfig, ListenerDef, ListenerError, build_listeners, filter_expansion,
    key_expansion,
};
pub use manager::{ListenerManager, ManagerError};
pub use publish::{Notifier, PublishError, Published, parse_params};
pub use trigger::{
    CloudEventsSpec, FunctionRegistry, TriggerDispatcher, TriggerError, TriggerFn, TriggerSpec,
};
