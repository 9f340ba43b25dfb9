//! Dispatch
//!
//! Handlers are scripts assembled from configuration fragments. Each binds to
//! named dispatchers, and invoking a dispatcher runs every bound handler.

mod dispatcher;
mod handler;

pub use dispatcher::*;
pub use handler::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ScriptCompiler;
    use crate::project::ConfigNode;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use vesper_script::{CapturedConsole, ReferenceEngine, ScriptContext, ScriptEngine};

    struct Fixture {
        registry: DispatcherRegistry,
        engine: Arc<dyn ScriptEngine>,
        console: Arc<CapturedConsole>,
    }

    impl Fixture {
        fn new(dispatchers: &[&str]) -> Self {
            let engine: Arc<dyn ScriptEngine> = Arc::new(ReferenceEngine::new());
            let registry = DispatcherRegistry::new(Arc::clone(&engine));
            for id in dispatchers {
                registry.register(id);
            }
            Self {
                registry,
                engine,
                console: Arc::new(CapturedConsole::default()),
            }
        }

        fn handler(&self, id: &str, config: &str) -> Arc<Handler> {
            let node = ConfigNode::new(config.parse().unwrap());
            let handler = Handler::new(id, Path::new("handlers/test.toml"), node, Arc::clone(&self.engine), &self.registry).unwrap();
            for dispatcher in handler.dispatchers() {
                dispatcher.compile_script().unwrap();
            }
            handler
        }

        async fn fire(&self, dispatcher: &str) -> (Result<usize, DispatchError>, Vec<String>) {
            self.console.clear();
            let mut ctx = ScriptContext::new(self.console.clone());
            let result = self.registry.get(dispatcher).unwrap().invoke(&mut ctx).await;
            (result, self.console.lines())
        }
    }

    #[tokio::test]
    async fn test_single_handler_prints() {
        let f = Fixture::new(&["d1"]);
        let _h1 = f.handler("h1", "bind = \"d1\"\nhandle = 'print *\"hi\"'");

        let (result, lines) = f.fire("d1").await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(lines, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_condition_false_runs_deny() {
        let f = Fixture::new(&["d1"]);
        let _h2 = f.handler(
            "h2",
            "bind = [\"d1\"]\ncondition = '<false>'\ndeny = 'print *\"denied\"'\nhandle = 'print *\"ran\"'",
        );

        let (result, lines) = f.fire("d1").await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["denied"]);
    }

    #[tokio::test]
    async fn test_priority_then_bind_order() {
        let f = Fixture::new(&["d"]);
        let _low = f.handler("low", "bind = \"d\"\npriority = 1\nhandle = 'print *low'");
        let _first = f.handler("first", "bind = \"d\"\nhandle = 'print *first'");
        let _second = f.handler("second", "bind = \"d\"\nhandle = 'print *second'");
        let _high = f.handler("high", "bind = \"d\"\npriority = 20\nhandle = 'print *high'");

        let (_, lines) = f.fire("d").await;
        assert_eq!(lines, vec!["high", "first", "second", "low"]);
    }

    #[tokio::test]
    async fn test_failure_stops_later_handlers() {
        let f = Fixture::new(&["d"]);
        let _early = f.handler("early", "bind = \"d\"\npriority = 10\nhandle = 'print *before'");
        let _bad = f.handler("bad", "bind = \"d\"\npriority = 9\nhandle = 'throw *\"io: gone\"'");
        let _good = f.handler("good", "bind = \"d\"\nhandle = 'print *after'");

        let (result, lines) = f.fire("d").await;
        assert!(matches!(result, Err(DispatchError::Handler { ref handler, .. }) if handler == "bad"));
        assert_eq!(lines, vec!["before"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_keeps_unit_across_recompile() {
        let f = Fixture::new(&["d"]);
        let _slow = f.handler("slow", "bind = \"d\"\nhandle = ['wait 100', 'print *slow']");
        let d = f.registry.get("d").unwrap();
        let before = d.revision();

        let mut ctx = ScriptContext::new(f.console.clone());
        let (result, _late) = tokio::join!(d.invoke(&mut ctx), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.handler("late", "bind = \"d\"\npriority = 1\nhandle = 'print *late'")
        });

        assert!(d.revision() > before);
        assert_eq!(result.unwrap(), 1);
        assert_eq!(f.console.lines(), vec!["slow"]);

        let (result, lines) = f.fire("d").await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(lines, vec!["slow", "late"]);
    }

    #[tokio::test]
    async fn test_exception_clause_guards_handle() {
        let f = Fixture::new(&["d"]);
        let _h = f.handler(
            "h",
            r#"
            bind = "d"
            handle = 'throw *"io: gone"'
            exception = [
                { catch = "net", handle = 'print *net' },
                { catch = "io", handle = 'print &error' },
            ]
            "#,
        );

        let (result, lines) = f.fire("d").await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["io: gone"]);
    }

    #[tokio::test]
    async fn test_catch_all_string_suppresses() {
        let f = Fixture::new(&["d"]);
        let _h = f.handler("h", "bind = \"d\"\nhandle = 'throw *x'\nexception = 'print *swallowed'");

        let (result, lines) = f.fire("d").await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["swallowed"]);
    }

    #[test]
    fn test_unknown_dispatcher_keeps_handler_valid() {
        let f = Fixture::new(&["d1"]);
        let h = f.handler("h", "bind = [\"d1\", \"missing\"]\nhandle = 'print 1'");
        assert!(h.compiled().is_some());
        let bound: Vec<_> = h.dispatchers().iter().map(|d| d.id().to_string()).collect();
        assert_eq!(bound, vec!["d1"]);
    }

    #[test]
    fn test_rebind_is_idempotent() {
        let f = Fixture::new(&["d1", "d2"]);
        let h = f.handler("h", "bind = [\"d1\", \"d2\"]\nhandle = 'print 1'");
        let d1 = f.registry.get("d1").unwrap();
        let revision = d1.revision();

        h.rebind(false, &f.registry);
        h.rebind(false, &f.registry);
        assert_eq!(d1.revision(), revision);
        assert_eq!(h.dispatchers().len(), 2);
        assert_eq!(d1.handlers().len(), 1);
    }

    #[tokio::test]
    async fn test_contrast_rebinds() {
        let f = Fixture::new(&["d1", "d2"]);
        let h = f.handler("h", "bind = \"d1\"\nhandle = 'print *moved'");

        let changes = h.contrast("bind = \"d2\"\nhandle = 'print *moved'".parse().unwrap(), &f.registry);
        assert!(changes.rebind && changes.reorder && !changes.recompile);

        let (_, lines) = f.fire("d1").await;
        assert!(lines.is_empty());
        let (_, lines) = f.fire("d2").await;
        assert_eq!(lines, vec!["moved"]);
    }

    #[tokio::test]
    async fn test_contrast_recompiles_dispatchers() {
        let f = Fixture::new(&["d"]);
        let h = f.handler("h", "bind = \"d\"\nhandle = 'print *old'");

        let changes = h.contrast("bind = \"d\"\nhandle = 'print *new'".parse().unwrap(), &f.registry);
        assert_eq!(
            changes,
            ChangeSet {
                recompile: true,
                rebind: false,
                reorder: false
            }
        );
        let (_, lines) = f.fire("d").await;
        assert_eq!(lines, vec!["new"]);
    }

    #[tokio::test]
    async fn test_failed_recompile_keeps_previous_unit() {
        let f = Fixture::new(&["d"]);
        let h = f.handler("h", "bind = \"d\"\nhandle = 'print *old'");
        let before = h.compiled().unwrap();

        h.contrast("bind = \"d\"\nhandle = 'print'".parse().unwrap(), &f.registry);
        assert!(Arc::ptr_eq(&before, &h.compiled().unwrap()));

        let (result, lines) = f.fire("d").await;
        assert!(result.is_ok());
        assert_eq!(lines, vec!["old"]);
    }

    #[tokio::test]
    async fn test_priority_change_reorders() {
        let f = Fixture::new(&["d"]);
        let a = f.handler("a", "bind = \"d\"\nhandle = 'print *a'");
        let _b = f.handler("b", "bind = \"d\"\nhandle = 'print *b'");

        a.contrast("bind = \"d\"\npriority = 0\nhandle = 'print *a'".parse().unwrap(), &f.registry);
        let (_, lines) = f.fire("d").await;
        assert_eq!(lines, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let f = Fixture::new(&["d"]);
        let h = f.handler("h", "bind = \"d\"\nhandle = 'print *kept'");

        let changes = h.contrast("bind = \"d\"\npriority = \"high\"".parse().unwrap(), &f.registry);
        assert_eq!(changes, ChangeSet::default());
        assert_eq!(h.priority(), DEFAULT_PRIORITY);
        let (_, lines) = f.fire("d").await;
        assert_eq!(lines, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_unbind_all_empties_dispatchers() {
        let f = Fixture::new(&["d"]);
        let h = f.handler("h", "bind = \"d\"\nhandle = 'print 1'");
        h.unbind_all();

        assert!(h.dispatchers().is_empty());
        let (result, _) = f.fire("d").await;
        assert_eq!(result.unwrap(), 0);
    }

    #[test]
    fn test_dropped_handler_leaves_dispatcher() {
        let f = Fixture::new(&["d"]);
        let h = f.handler("h", "bind = \"d\"\nhandle = 'print 1'");
        let d = f.registry.get("d").unwrap();
        assert_eq!(d.handlers().len(), 1);
        drop(h);
        assert!(d.handlers().is_empty());
    }

    #[test]
    fn test_entry_name_is_stable() {
        let f = Fixture::new(&[]);
        let a = f.handler("same", "handle = 'print 1'");
        let b = f.handler("same", "handle = 'print 2'");
        assert_eq!(a.entry(), b.entry());
        assert!(a.entry().starts_with("handler_"));
    }

    #[test]
    fn test_change_set_from_keys() {
        assert_eq!(ChangeSet::from_keys(&["disable", "unknown"]), ChangeSet::default());
        assert!(ChangeSet::from_keys(&["priority"]).reorder);
        assert!(ChangeSet::from_keys(&["namespace"]).recompile);
    }
}
