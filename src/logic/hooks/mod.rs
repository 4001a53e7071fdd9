//! Hook Pipeline
//!
//! Ordered `{name, predicate, action}` entries run on each event. The agent
//! keeps two managers: pre-detection hooks (bookkeeping, enrichment) and
//! post-detection hooks (dumps, scoring, actions). Actions run in
//! registration order on the same locked snapshot of agent state.

use crate::logic::agent::Agent;
use crate::logic::event::Event;

pub mod builtin;
pub mod dump;

pub type HookPredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;
pub type HookAction = Box<dyn Fn(&Agent, &mut Event) + Send + Sync>;

struct Hook {
    name: String,
    predicate: HookPredicate,
    action: HookAction,
}

#[derive(Default)]
pub struct HookManager {
    hooks: Vec<Hook>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action to run on events satisfying `predicate`
    pub fn hook<P, A>(&mut self, name: &str, predicate: P, action: A)
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        A: Fn(&Agent, &mut Event) + Send + Sync + 'static,
    {
        self.hooks.push(Hook {
            name: name.to_string(),
            predicate: Box::new(predicate),
            action: Box::new(action),
        });
    }

    /// Run matching hooks in order; returns how many ran
    pub fn run(&self, agent: &Agent, event: &mut Event) -> usize {
        let mut ran = 0;
        for hook in &self.hooks {
            if (hook.predicate)(event) {
                (hook.action)(agent, event);
                ran += 1;
            }
        }
        ran
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::Config;

    #[test]
    fn test_builtin_registration_order() {
        let mut pre = HookManager::new();
        builtin::register_pre_hooks(&mut pre);
        assert_eq!(pre.names(), vec!["self-guid", "proc-term", "track"]);

        let mut post = HookManager::new();
        builtin::register_post_hooks(&mut post, &Config::default());
        assert_eq!(post.names(), vec!["update-score", "handle-actions"]);
    }
}
