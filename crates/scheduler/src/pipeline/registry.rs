//! Runner lookup by content type
//!
//! The poller only knows a job's content type tag; the registry maps it to
//! the runner that knows how to process that kind of content.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::JobRunner;

/// Registry of job runners keyed by content type
#[derive(Default, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner under its own content type
    ///
    /// A later registration for the same content type replaces the earlier one.
    pub fn register<R: JobRunner>(&mut self, runner: R) -> &mut Self {
        self.register_arc(Arc::new(runner))
    }

    /// Register a shared runner
    pub fn register_arc(&mut self, runner: Arc<dyn JobRunner>) -> &mut Self {
        self.runners.insert(runner.content_type().to_string(), runner);
        self
    }

    /// Builder-style registration
    pub fn with_runner<R: JobRunner>(mut self, runner: R) -> Self {
        self.register(runner);
        self
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(content_type).cloned()
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.runners.contains_key(content_type)
    }

    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("content_types", &self.content_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::job::JobOutcome;
    use crate::pipeline::JobContext;

    struct FixedRunner(&'static str);

    #[async_trait]
    impl JobRunner for FixedRunner {
        fn content_type(&self) -> &str {
            self.0
        }

        async fn execute(&self, ctx: JobContext) -> JobOutcome {
            JobOutcome::error(ctx.job.id, self.0)
        }
    }

    #[test]
    fn test_lookup_by_content_type() {
        let registry = RunnerRegistry::new()
            .with_runner(FixedRunner("qvw"))
            .with_runner(FixedRunner("pbix"));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("qvw"));
        assert_eq!(registry.get("pbix").unwrap().content_type(), "pbix");
        assert!(registry.get("xlsx").is_none());
        assert_eq!(registry.content_types(), vec!["pbix", "qvw"]);
    }

    #[test]
    fn test_later_registration_wins() {
        let mut registry = RunnerRegistry::new();
        registry.register(FixedRunner("qvw"));
        registry.register(FixedRunner("qvw"));
        assert_eq!(registry.len(), 1);
    }
}
