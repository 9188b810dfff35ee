use crate::provider::ToolSpec;
use futures_core::future::BoxFuture;
use std::sync::Arc;

/// A capability the model can call by name.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> &serde_json::Value;

    /// Run the tool. Errors are reported back to the model, not to the user.
    fn invoke(&self, arguments: serde_json::Value) -> BoxFuture<'_, anyhow::Result<String>>;
}

/// Something a registry keeps open while its tools are in use (e.g. a server process).
pub trait Connection: Send + Sync {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Opens a fresh registry for one turn-cycle.
pub trait ToolSource: Send + Sync {
    fn open(&self) -> BoxFuture<'_, anyhow::Result<ToolRegistry>>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    connections: Vec<Box<dyn Connection>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn hold(&mut self, conn: Box<dyn Connection>) {
        self.connections.push(conn);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve a tool by name, ignoring ASCII case.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema().clone(),
            })
            .collect()
    }

    /// Release every held connection.
    pub async fn close(self) {
        for conn in self.connections {
            conn.close().await;
        }
    }
}

/// Used when tools are disabled or no tool transport is compiled in.
#[derive(Debug, Default, Clone)]
pub struct NoTools;

impl ToolSource for NoTools {
    fn open(&self) -> BoxFuture<'_, anyhow::Result<ToolRegistry>> {
        Box::pin(async { Ok(ToolRegistry::default()) })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Handler = dyn Fn(serde_json::Value) -> anyhow::Result<String> + Send + Sync;

    pub struct FnTool {
        name: String,
        schema: serde_json::Value,
        handler: Box<Handler>,
        pub calls: Mutex<Vec<serde_json::Value>>,
    }

    impl FnTool {
        pub fn new(
            name: &str,
            handler: impl Fn(serde_json::Value) -> anyhow::Result<String> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                schema: serde_json::json!({"type": "object"}),
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Tool for FnTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn input_schema(&self) -> &serde_json::Value {
            &self.schema
        }

        fn invoke(&self, arguments: serde_json::Value) -> BoxFuture<'_, anyhow::Result<String>> {
            self.calls.lock().unwrap().push(arguments.clone());
            let out = (self.handler)(arguments);
            Box::pin(async move { out })
        }
    }

    /// Hands out the same tools every cycle and counts opens and closes.
    #[derive(Default)]
    pub struct StaticTools {
        pub tools: Vec<Arc<dyn Tool>>,
        pub opened: Arc<AtomicUsize>,
        pub closed: Arc<AtomicUsize>,
    }

    struct CountingConnection(Arc<AtomicUsize>);

    impl Connection for CountingConnection {
        fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    impl ToolSource for StaticTools {
        fn open(&self) -> BoxFuture<'_, anyhow::Result<ToolRegistry>> {
            Box::pin(async move {
                self.opened.fetch_add(1, Ordering::SeqCst);
                let mut reg = ToolRegistry::default();
                for t in &self.tools {
                    reg.register(t.clone());
                }
                reg.hold(Box::new(CountingConnection(self.closed.clone())));
                Ok(reg)
            })
        }
    }
}
