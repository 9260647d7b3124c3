use std::collections::HashMap;
use std::sync::Arc;

use mender_core::ActionType;

use crate::handler::DynHandler;

/// Dispatch table from [`ActionType`] to handler.
///
/// Built once at startup and handed to the engine; not mutated afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own [`DynHandler::action_type`].
    ///
    /// A handler already registered for the same type is replaced.
    pub fn register(&mut self, handler: Arc<dyn DynHandler>) {
        self.handlers.insert(handler.action_type(), handler);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn DynHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(&action_type).cloned()
    }

    /// Registered action types, sorted by tag.
    pub fn list(&self) -> Vec<ActionType> {
        let mut types: Vec<ActionType> = self.handlers.keys().copied().collect();
        types.sort_unstable_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("action_types", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notify_handler::NotifyHandler;
    use crate::notifier::LogNotifier;

    #[test]
    fn empty_registry() {
        let reg = HandlerRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.list().is_empty());
        assert!(reg.get(ActionType::Retry).is_none());
    }

    #[test]
    fn register_and_get() {
        let reg = HandlerRegistry::new()
            .with(Arc::new(NotifyHandler::new(Arc::new(LogNotifier::new()))));

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.list(), vec![ActionType::Notify]);
        let handler = reg.get(ActionType::Notify).expect("notify handler should exist");
        assert_eq!(handler.action_type(), ActionType::Notify);
        assert!(reg.get(ActionType::Redistribute).is_none());
    }

    #[test]
    fn register_replaces_same_type() {
        let mut reg = HandlerRegistry::new();
        reg.register(Arc::new(NotifyHandler::new(Arc::new(LogNotifier::new()))));
        reg.register(Arc::new(NotifyHandler::new(Arc::new(LogNotifier::new()))));
        assert_eq!(reg.len(), 1);
    }
}
