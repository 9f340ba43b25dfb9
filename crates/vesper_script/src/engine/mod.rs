//! Reference Engine
//!
//! A small statement language that implements [`ScriptEngine`]. Hosts extend
//! it by registering namespaces of leaf actions; the core itself never looks
//! inside the language.

mod interpreter;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::sync::Arc;

pub use interpreter::{Action, ERROR_VARIABLE};
pub use parser::MAIN_ROUTINE;

use parser::{ActionDef, ActionTable};

use crate::unit::{BlockTable, CompileError, CompiledUnit, Executable, ScriptEngine};

/// Namespace that is always enabled
pub const CORE_NAMESPACE: &str = "vesper";

/// Built-in [`ScriptEngine`] for the statement DSL
pub struct ReferenceEngine {
    namespaces: HashMap<String, HashMap<String, ActionDef>>,
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceEngine {
    /// Create an engine with only the core namespace
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(CORE_NAMESPACE.to_string(), HashMap::new());
        Self { namespaces }
    }

    /// Make a namespace available, even if it has no actions yet
    pub fn register_namespace(&mut self, namespace: impl Into<String>) {
        self.namespaces.entry(namespace.into()).or_default();
    }

    /// Register a leaf action taking exactly `arity` arguments
    pub fn register_action(
        &mut self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        arity: usize,
        action: Arc<dyn Action>,
    ) {
        self.namespaces
            .entry(namespace.into())
            .or_default()
            .insert(name.into(), ActionDef { arity, action });
    }

    /// Check if a namespace is registered
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Merge the core namespace and the requested ones; earlier wins
    fn action_table(&self, namespaces: &[String]) -> Result<ActionTable, CompileError> {
        let mut table = ActionTable::new();
        let requested = std::iter::once(CORE_NAMESPACE).chain(namespaces.iter().map(|s| s.as_str()));
        for namespace in requested {
            let actions = self
                .namespaces
                .get(namespace)
                .ok_or_else(|| CompileError::UnknownNamespace(namespace.to_string()))?;
            for (name, def) in actions {
                table.entry(name.clone()).or_insert_with(|| def.clone());
            }
        }
        Ok(table)
    }
}

impl ScriptEngine for ReferenceEngine {
    fn compile(&self, source: &str, namespaces: &[String]) -> Result<CompiledUnit, CompileError> {
        let actions = self.action_table(namespaces)?;
        let tokens = lexer::tokenize(source)?;
        let routines = parser::parse(tokens, &actions)?;

        let blocks: BlockTable = routines
            .into_iter()
            .map(|(name, node)| (name, node as Arc<dyn Executable>))
            .collect();

        tracing::trace!(blocks = blocks.len(), "Compiled script");
        Ok(CompiledUnit::new(source, namespaces, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CapturedConsole, ScriptContext};
    use crate::live::LiveParameter;
    use crate::unit::{ScriptError, ScriptResult};
    use async_trait::async_trait;
    use serde_json::Value;

    fn context() -> (ScriptContext, Arc<CapturedConsole>) {
        let console = Arc::new(CapturedConsole::default());
        (ScriptContext::new(console.clone()), console)
    }

    async fn run(source: &str) -> (ScriptResult<Value>, Vec<String>) {
        let unit = ReferenceEngine::new().compile(source, &[]).unwrap();
        let (mut ctx, console) = context();
        let result = unit.invoke(MAIN_ROUTINE, &mut ctx).await;
        (result, console.lines())
    }

    #[tokio::test]
    async fn test_print() {
        let (result, lines) = run("print *\"hi\"").await;
        assert_eq!(result, Ok(Value::Null));
        assert_eq!(lines, vec!["hi"]);
    }

    #[tokio::test]
    async fn test_if_else() {
        let (_, lines) = run("if <false> then print *yes else print *no").await;
        assert_eq!(lines, vec!["no"]);

        let (_, lines) = run("if { set x to 1 &x } then { print *yes }").await;
        assert_eq!(lines, vec!["yes"]);
    }

    #[tokio::test]
    async fn test_variables_and_not() {
        let (result, _) = run("set flag to true not &flag").await;
        assert_eq!(result, Ok(Value::Bool(false)));

        let (result, _) = run("get missing").await;
        assert_eq!(result, Ok(Value::Null));
    }

    #[tokio::test]
    async fn test_try_catch_by_kind() {
        let source = r#"
            try {
                throw *"io: disk full"
            } catch with "net" {
                print *net
            } catch with "io" {
                print &error
            }
        "#;
        let (result, lines) = run(source).await;
        assert_eq!(result, Ok(Value::Null));
        assert_eq!(lines, vec!["io: disk full"]);
    }

    #[tokio::test]
    async fn test_unmatched_error_propagates() {
        let (result, lines) = run("try { throw *boom } catch with \"net*\" { print *caught }").await;
        assert_eq!(result, Err(ScriptError::thrown("error", "boom")));
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_routines_and_call() {
        let source = "def helper = { print *inner } def main = { call helper print *outer }";
        let (_, lines) = run(source).await;
        assert_eq!(lines, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn test_recursion_is_bounded() {
        let (result, _) = run("def main = { call main }").await;
        assert!(matches!(result, Err(ScriptError::DepthExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_suspends() {
        let start = tokio::time::Instant::now();
        let (_, lines) = run("wait 250 print *done").await;
        assert_eq!(lines, vec!["done"]);
        assert!(start.elapsed() >= std::time::Duration::from_millis(250));
    }

    #[test]
    fn test_compile_errors() {
        let engine = ReferenceEngine::new();
        assert!(matches!(
            engine.compile("print", &[]),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(
            engine.compile("def a = { print 1 } def a = { print 2 }", &[]),
            Err(CompileError::DuplicateRoutine(name)) if name == "a"
        ));
        assert!(matches!(
            engine.compile("call nowhere", &[]),
            Err(CompileError::UndefinedRoutine(_))
        ));
        assert!(matches!(
            engine.compile("particle flame", &[]),
            Err(CompileError::UnknownAction { line: 1, column: 1, .. })
        ));
        assert_eq!(
            engine.compile("print 1", &["missing".to_string()]).unwrap_err(),
            CompileError::UnknownNamespace("missing".to_string())
        );
    }

    struct Concat;

    #[async_trait]
    impl Action for Concat {
        async fn execute(
            &self,
            args: &[LiveParameter<Value>],
            ctx: &mut ScriptContext,
        ) -> ScriptResult<Value> {
            let mut out = String::new();
            for arg in args {
                out.push_str(&crate::context::display_value(&arg.resolve(ctx).await?));
            }
            Ok(Value::String(out))
        }
    }

    #[tokio::test]
    async fn test_host_action_in_namespace() {
        let mut engine = ReferenceEngine::new();
        engine.register_action("text", "concat", 2, Arc::new(Concat));

        assert!(matches!(
            engine.compile("print concat *a *b", &[]),
            Err(CompileError::UnknownAction { .. })
        ));

        let unit = engine
            .compile("set b to *z print concat *a &b", &["text".to_string()])
            .unwrap();
        let (mut ctx, console) = context();
        unit.invoke(MAIN_ROUTINE, &mut ctx).await.unwrap();
        assert_eq!(console.lines(), vec!["az"]);
    }
}
