use super::StateMachine;

use std::collections::HashMap;

/// A factory producing fresh state machine instances.
pub type Factory = Box<dyn Fn() -> Box<dyn StateMachine> + Send + Sync>;

/// A registry of user state machines by name. Servers construct their state
/// machine from the registry at startup, so the choice of state machine is
/// configuration rather than code.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Registers a state machine factory under a name, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn StateMachine> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    /// Removes a registration.
    pub fn unregister(&mut self, name: &str) -> &mut Self {
        self.factories.remove(name);
        self
    }

    /// Builds a fresh state machine instance by name.
    pub fn build(&self, name: &str) -> Option<Box<dyn StateMachine>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Returns the number of registered state machines.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if no state machines are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
