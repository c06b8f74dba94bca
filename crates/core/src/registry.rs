use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::node::ExecuteBehavior;

/// Name to behavior table. Filled once at startup, then shared read-only
/// behind an `Arc` by the scheduler and the VM bridge.
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn ExecuteBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
        }
    }

    pub fn register<B>(&mut self, behavior: B)
    where
        B: ExecuteBehavior + 'static,
    {
        self.register_shared(Arc::new(behavior));
    }

    pub fn register_shared(&mut self, behavior: Arc<dyn ExecuteBehavior>) {
        self.behaviors
            .insert(behavior.behavior_name().to_string(), behavior);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ExecuteBehavior>> {
        self.behaviors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown behavior: {name}"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.behaviors.contains_key(name)
    }

    pub fn list_behaviors(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.behaviors.keys().map(|v| v.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BehaviorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every builtin behavior shipped with `seqflow-core`.
pub fn register_builtin_behaviors(registry: &mut BehaviorRegistry) {
    use crate::nodes::call_action::{CallActionBehavior, OutputBehavior};
    use crate::nodes::catch_error::CatchErrorBehavior;
    use crate::nodes::constant::ConstantBehavior;
    use crate::nodes::delay::DelayBehavior;
    use crate::nodes::error::ErrorBehavior;
    use crate::nodes::log::LogBehavior;
    use crate::nodes::set_variable::SetVariableBehavior;
    use crate::nodes::split_lines::SplitLinesBehavior;
    use crate::nodes::start::StartBehavior;

    registry.register(StartBehavior);
    registry.register(ConstantBehavior);
    registry.register(LogBehavior);
    registry.register(ErrorBehavior);
    registry.register(DelayBehavior);
    registry.register(CallActionBehavior);
    registry.register(CatchErrorBehavior);
    registry.register(OutputBehavior);
    registry.register(SetVariableBehavior);
    registry.register(SplitLinesBehavior);
}

pub fn build_default_registry() -> BehaviorRegistry {
    let mut registry = BehaviorRegistry::new();
    register_builtin_behaviors(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::Disposer;

    struct DummyBehavior;

    impl ExecuteBehavior for DummyBehavior {
        fn behavior_name(&self) -> &str {
            "dummy"
        }

        fn execute(&self, _ctx: &mut ExecutionContext<'_>) -> Result<Option<Disposer>> {
            Ok(None)
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = BehaviorRegistry::new();
        registry.register(DummyBehavior);

        let behavior = registry.get("dummy").expect("dummy should be registered");
        assert_eq!(behavior.behavior_name(), "dummy");
        assert!(registry.contains("dummy"));
        assert_eq!(registry.list_behaviors(), vec!["dummy"]);
    }

    #[test]
    fn test_registry_unknown_behavior_errors() {
        let registry = BehaviorRegistry::new();
        let err = match registry.get("Missing") {
            Ok(_) => panic!("unknown behavior should error"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "unknown behavior: Missing");
    }

    #[test]
    fn test_builtin_behaviors_expected_set() {
        let registry = build_default_registry();
        assert_eq!(
            registry.list_behaviors(),
            vec![
                "CallAction",
                "CatchError",
                "Constant",
                "Delay",
                "Error",
                "Log",
                "Output",
                "SetVariable",
                "SplitLines",
                "Start",
            ]
        );
    }
}
