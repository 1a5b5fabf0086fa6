//! Ops - named, traced units of work
//!
//! An [`Op`] carries the metadata of a traced function and drives the call lifecycle:
//! resolve the current call stack, start a [`Call`] under its top, run the body with the
//! pushed stack, then finish the call and hand the end event to the client. The body's
//! result is returned unchanged; tracing never swallows application errors.
//!
//! [`Op::wrap`] turns a closure into a [`TracedFn`], the higher-order equivalent of a
//! decorator. Methods are wrapped by capturing the receiver in the closure.

use crate::call::Call;
use crate::client::TraceClient;
use crate::context::CallStack;
use crate::refs::ObjectRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Computes a display name from a call's captured inputs
pub type DisplayNameFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// The persisted definition of an op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,

    /// Hex SHA-256 over the name and parameter names
    pub digest: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_names: Vec<String>,
}

impl OpDef {
    pub fn new(name: impl Into<String>, parameter_names: Vec<String>) -> Self {
        let name = name.into();
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        for param in &parameter_names {
            hasher.update([0u8]);
            hasher.update(param.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());

        Self {
            name,
            digest,
            parameter_names,
        }
    }
}

/// Derive an op name from a function's type path.
///
/// `my_crate::handlers::summarize` becomes `summarize`; closures are named after the
/// function that declares them.
pub fn derive_op_name(type_name: &str) -> String {
    let mut path = type_name;
    while let Some(stripped) = path.strip_suffix("::{{closure}}") {
        path = stripped;
    }
    // Generic arguments would otherwise leak `::` segments into the name
    let path = path.split('<').next().unwrap_or(path);
    path.rsplit("::").next().unwrap_or(path).to_string()
}

/// Builder for [`Op`]
pub struct OpBuilder {
    name: String,
    parameter_names: Vec<String>,
    display_name: Option<DisplayNameFn>,
}

impl OpBuilder {
    /// Positional argument names, used to key tuple arguments in captured inputs
    pub fn parameter_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_name<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.display_name = Some(Arc::new(f));
        self
    }

    pub fn build(self, client: Arc<TraceClient>) -> Op {
        Op {
            def: OpDef::new(self.name, self.parameter_names),
            display_name: self.display_name,
            op_ref: once_cell::sync::OnceCell::new(),
            client,
        }
    }
}

/// A named, traced unit of work
pub struct Op {
    def: OpDef,
    display_name: Option<DisplayNameFn>,
    op_ref: once_cell::sync::OnceCell<ObjectRef>,
    client: Arc<TraceClient>,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("def", &self.def)
            .field("op_ref", &self.op_ref.get())
            .finish_non_exhaustive()
    }
}

impl Op {
    pub fn new(client: Arc<TraceClient>, name: impl Into<String>) -> Self {
        Self::builder(name).build(client)
    }

    pub fn builder(name: impl Into<String>) -> OpBuilder {
        OpBuilder {
            name: name.into(),
            parameter_names: Vec::new(),
            display_name: None,
        }
    }

    /// Op named after the declaring function of `f`
    pub fn named_after<F>(client: Arc<TraceClient>, _f: &F) -> Self {
        Self::new(client, derive_op_name(std::any::type_name::<F>()))
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &OpDef {
        &self.def
    }

    pub fn client(&self) -> &Arc<TraceClient> {
        &self.client
    }

    /// The op's reference, `None` until the first call saves it
    pub fn op_ref(&self) -> Option<&ObjectRef> {
        self.op_ref.get()
    }

    /// Reference to use for the next call.
    ///
    /// Always goes through the client so an op whose save was dropped is queued again.
    fn ensure_saved(&self) -> ObjectRef {
        let op_ref = self.client.save_op(&self.def);
        let _ = self.op_ref.set(op_ref.clone());
        op_ref
    }

    /// Capture serialized arguments as a named input mapping
    pub fn capture_inputs<A: Serialize + ?Sized>(&self, args: &A) -> Value {
        let value = match serde_json::to_value(args) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to capture inputs of op {}: {}", self.def.name, e);
                return Value::Object(Map::new());
            }
        };

        match value {
            Value::Object(_) => value,
            Value::Array(items) => Value::Object(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (self.param_name(i), v))
                    .collect(),
            ),
            Value::Null if self.def.parameter_names.is_empty() => Value::Object(Map::new()),
            scalar => {
                let mut map = Map::new();
                map.insert(self.param_name(0), scalar);
                Value::Object(map)
            }
        }
    }

    fn param_name(&self, i: usize) -> String {
        self.def
            .parameter_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("arg{}", i))
    }

    /// Start a call under the current stack and enqueue its start event
    fn begin(&self, stack: &CallStack, inputs: Value) -> Call {
        let op_ref = self.ensure_saved();
        let mut call = Call::start(&self.def.name, op_ref, stack.current_call(), inputs);
        if let Some(display_name) = &self.display_name {
            call.display_name = Some(display_name(&call.inputs));
        }
        self.client.create_call(&call);
        call
    }

    fn complete<T: Serialize, E: fmt::Display>(&self, call: &mut Call, result: &Result<T, E>) {
        match result {
            Ok(value) => {
                let output = serde_json::to_value(value).unwrap_or_else(|e| {
                    warn!("Failed to capture output of op {}: {}", self.def.name, e);
                    Value::Null
                });
                self.client.finish_call(call, output);
            }
            Err(e) => self.client.finish_call_with_exception(call, e),
        }
    }

    /// Trace `body` as one call of this op
    pub async fn run<T, E, Fut>(&self, inputs: Value, body: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display,
    {
        self.run_with_call(inputs, body).await.0
    }

    /// Like [`Op::run`], also returning the finished call
    pub async fn run_with_call<T, E, Fut>(&self, inputs: Value, body: Fut) -> (Result<T, E>, Call)
    where
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display,
    {
        let stack = CallStack::current();
        let mut call = self.begin(&stack, inputs);
        let result = stack.push(call.stack_entry()).scope(body).await;
        self.complete(&mut call, &result);
        (result, call)
    }

    /// Trace a blocking closure as one call of this op
    pub fn run_sync<T, E, F>(&self, inputs: Value, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        T: Serialize,
        E: fmt::Display,
    {
        let stack = CallStack::current();
        let mut call = self.begin(&stack, inputs);
        let result = stack.push(call.stack_entry()).sync_scope(body);
        self.complete(&mut call, &result);
        result
    }

    /// Wrap `func` so every invocation is traced as a call of this op
    pub fn wrap<A, F>(self, func: F) -> TracedFn<A, F> {
        TracedFn {
            op: Arc::new(self),
            func,
            _args: PhantomData,
        }
    }
}

/// A function wrapped by an [`Op`]
pub struct TracedFn<A, F> {
    op: Arc<Op>,
    func: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F: Clone> Clone for TracedFn<A, F> {
    fn clone(&self) -> Self {
        Self {
            op: self.op.clone(),
            func: self.func.clone(),
            _args: PhantomData,
        }
    }
}

impl<A, F> TracedFn<A, F> {
    pub fn op(&self) -> &Arc<Op> {
        &self.op
    }
}

impl<A, F, Fut, T, E> TracedFn<A, F>
where
    A: Serialize,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: fmt::Display,
{
    pub async fn call(&self, args: A) -> Result<T, E> {
        self.invoke(args).await.0
    }

    /// Call and also return the finished [`Call`], without waiting for delivery
    pub async fn invoke(&self, args: A) -> (Result<T, E>, Call) {
        let inputs = self.op.capture_inputs(&args);
        let func = &self.func;
        self.op
            .run_with_call(inputs, async move { func(args).await })
            .await
    }
}

/// Wrap `func` in an op named after its declaring function
pub fn traced<A, F>(client: Arc<TraceClient>, func: F) -> TracedFn<A, F> {
    Op::named_after(client, &func).wrap(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::call::CallStatus;
    use crate::client::ClientConfig;
    use serde_json::json;
    use std::convert::Infallible;
    use std::pin::Pin;

    fn setup() -> (Arc<MemoryBackend>, Arc<TraceClient>) {
        let backend = Arc::new(MemoryBackend::new());
        let client = TraceClient::new(backend.clone(), ClientConfig::default());
        (backend, client)
    }

    fn summarize() {}

    #[test]
    fn test_derive_op_name() {
        assert_eq!(derive_op_name("my_crate::handlers::summarize"), "summarize");
        assert_eq!(derive_op_name("my_crate::handlers::run::{{closure}}"), "run");
        assert_eq!(
            derive_op_name("my_crate::outer::{{closure}}::{{closure}}"),
            "outer"
        );
        assert_eq!(derive_op_name("plain"), "plain");
        assert_eq!(derive_op_name("a::b::parse<alloc::string::String>"), "parse");
        assert_eq!(derive_op_name(std::any::type_name_of_val(&summarize)), "summarize");
    }

    #[test]
    fn test_op_digest_is_stable() {
        let a = OpDef::new("add", vec!["a".into(), "b".into()]);
        let b = OpDef::new("add", vec!["a".into(), "b".into()]);
        let c = OpDef::new("add", vec!["ab".into()]);
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[tokio::test]
    async fn test_capture_inputs() {
        let (_backend, client) = setup();
        let named = Op::builder("add")
            .parameter_names(["a", "b"])
            .build(client.clone());
        assert_eq!(named.capture_inputs(&(1, 2)), json!({"a": 1, "b": 2}));
        assert_eq!(named.capture_inputs(&5), json!({"a": 5}));

        let anon = Op::new(client, "anon");
        assert_eq!(anon.capture_inputs(&(1, "x")), json!({"arg0": 1, "arg1": "x"}));
        assert_eq!(anon.capture_inputs(&json!({"q": 1})), json!({"q": 1}));
        assert_eq!(anon.capture_inputs(&()), json!({}));
    }

    #[tokio::test]
    async fn test_wrapped_call_success() {
        let (backend, client) = setup();
        let add = Op::builder("add")
            .parameter_names(["a", "b"])
            .display_name(|inputs| format!("add {} + {}", inputs["a"], inputs["b"]))
            .build(client.clone())
            .wrap(|(a, b): (i64, i64)| async move { Ok::<_, Infallible>(a + b) });

        let (result, call) = add.invoke((2, 3)).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(call.status, CallStatus::Success);
        assert_eq!(call.display_name.as_deref(), Some("add 2 + 3"));
        assert!(add.op().op_ref().is_some());

        client.wait_for_batch_processing().await;
        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, call.id);
        assert_eq!(calls[0].inputs, json!({"a": 2, "b": 3}));
        assert_eq!(calls[0].output, Some(json!(5)));
        assert_eq!(backend.saved_ops().len(), 1);
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let (backend, client) = setup();
        let div = Op::new(client.clone(), "div").wrap(|(a, b): (i64, i64)| async move {
            if b == 0 {
                Err(format!("cannot divide {} by zero", a))
            } else {
                Ok(a / b)
            }
        });

        let err = div.call((4, 0)).await.unwrap_err();
        assert_eq!(err, "cannot divide 4 by zero");

        client.wait_for_batch_processing().await;
        let calls = backend.calls();
        assert_eq!(calls[0].status, CallStatus::Error);
        assert_eq!(calls[0].exception.as_deref(), Some("cannot divide 4 by zero"));
        assert!(calls[0].ended_at.unwrap() >= calls[0].started_at);
    }

    #[tokio::test]
    async fn test_nested_calls_share_trace() {
        let (backend, client) = setup();
        let inner = Arc::new(Op::new(client.clone(), "inner"));
        let outer = Op::new(client.clone(), "outer");

        let inner_ref = inner.clone();
        let (_, outer_call) = outer
            .run_with_call(json!({}), async move {
                tokio::task::yield_now().await;
                let (_, inner_call) = inner_ref
                    .run_with_call(json!({}), async { Ok::<_, Infallible>(1) })
                    .await;
                Ok::<_, Infallible>(inner_call)
            })
            .await;

        client.wait_for_batch_processing().await;
        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        let inner_call = calls.iter().find(|c| c.op_name == "inner").unwrap();
        assert_eq!(inner_call.parent_id.as_deref(), Some(outer_call.id.as_str()));
        assert_eq!(inner_call.trace_id, outer_call.trace_id);
    }

    fn depth_chain(
        op: Arc<Op>,
        n: u32,
    ) -> Pin<Box<dyn Future<Output = Result<u32, Infallible>> + Send>> {
        Box::pin(async move {
            let next = op.clone();
            op.run(json!({ "n": n }), async move {
                if n == 0 {
                    return Ok(0);
                }
                tokio::task::yield_now().await;
                Ok(depth_chain(next, n - 1).await? + 1)
            })
            .await
        })
    }

    #[tokio::test]
    async fn test_recursive_op_nests_one_call_per_invocation() {
        let (backend, client) = setup();
        let op = Arc::new(Op::new(client.clone(), "countdown"));

        assert_eq!(depth_chain(op, 4).await.unwrap(), 4);
        client.wait_for_batch_processing().await;

        let calls = backend.calls();
        assert_eq!(calls.len(), 5);
        for pair in calls.windows(2) {
            assert_eq!(pair[1].parent_id.as_deref(), Some(pair[0].id.as_str()));
            assert_eq!(pair[1].trace_id, pair[0].trace_id);
        }
        let depths: Vec<u64> = calls
            .iter()
            .map(|c| c.inputs["n"].as_u64().unwrap())
            .collect();
        assert_eq!(depths, vec![4, 3, 2, 1, 0]);
        assert!(calls[0].parent_id.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_siblings_get_distinct_parents() {
        let (backend, client) = setup();
        let parent = Arc::new(Op::new(client.clone(), "row"));
        let child = Arc::new(Op::new(client.clone(), "step"));

        let chain = |label: &'static str| {
            let parent = parent.clone();
            let child = child.clone();
            async move {
                parent
                    .run_with_call(json!({ "label": label }), async move {
                        for _ in 0..3 {
                            tokio::task::yield_now().await;
                            child
                                .run(json!({ "label": label }), async {
                                    tokio::task::yield_now().await;
                                    Ok::<_, Infallible>(())
                                })
                                .await?;
                        }
                        Ok::<_, Infallible>(())
                    })
                    .await
                    .1
            }
        };

        let (a, b) = tokio::join!(chain("a"), chain("b"));
        client.wait_for_batch_processing().await;

        let calls = backend.calls();
        for step in calls.iter().filter(|c| c.op_name == "step") {
            let expected = if step.inputs["label"] == "a" { &a } else { &b };
            assert_eq!(step.parent_id.as_deref(), Some(expected.id.as_str()));
        }
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[tokio::test]
    async fn test_wrapped_closure_body_runs_inside_call() {
        let (_backend, client) = setup();
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let observed = seen.clone();
        let record_stack = Op::new(client, "stack").wrap(move |_: ()| {
            *observed.lock() = CallStack::current().current_call().cloned();
            async { Ok::<_, Infallible>(()) }
        });

        let (_, call) = record_stack.invoke(()).await;
        let entry = seen.lock().clone().expect("closure saw no active call");
        assert_eq!(entry.call_id, call.id);
        assert!(CallStack::current().current_call().is_none());
    }

    struct Greeter {
        greeting: String,
    }

    impl Greeter {
        async fn greet(&self, name: &str) -> Result<String, Infallible> {
            Ok(format!("{}, {}", self.greeting, name))
        }
    }

    #[tokio::test]
    async fn test_wrapped_method_keeps_receiver() {
        let (_backend, client) = setup();
        let greeter = Arc::new(Greeter {
            greeting: "hello".to_string(),
        });

        let receiver = greeter.clone();
        let greet = Op::builder("Greeter.greet")
            .parameter_names(["name"])
            .build(client)
            .wrap(move |name: String| {
                let receiver = receiver.clone();
                async move { receiver.greet(&name).await }
            });

        assert_eq!(greet.call("ada".to_string()).await.unwrap(), "hello, ada");
        assert_eq!(
            greet.call("ada".to_string()).await.unwrap(),
            greeter.greet("ada").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_sync_nests_under_async_parent() {
        let (backend, client) = setup();
        let parent = Op::new(client.clone(), "parent");
        let sync_op = Op::new(client.clone(), "sync_child");

        let (_, parent_call) = parent
            .run_with_call(json!({}), async {
                sync_op.run_sync(json!({"x": 1}), || Ok::<_, Infallible>(2))
            })
            .await;

        client.wait_for_batch_processing().await;
        let calls = backend.calls();
        let child = calls.iter().find(|c| c.op_name == "sync_child").unwrap();
        assert_eq!(child.parent_id.as_deref(), Some(parent_call.id.as_str()));
        assert_eq!(child.output, Some(json!(2)));
    }

    async fn fetch_score(x: i64) -> Result<i64, Infallible> {
        Ok(x * 10)
    }

    #[tokio::test]
    async fn test_traced_names_op_after_function() {
        let (_backend, client) = setup();
        let op = traced(client, fetch_score);
        assert_eq!(op.op().name(), "fetch_score");
        assert_eq!(op.call(4).await.unwrap(), 40);
    }
}
