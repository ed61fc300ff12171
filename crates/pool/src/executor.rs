//! One invocation, one isolate.
//!
//! Every call gets a fresh `JsRuntime` with the host extension installed, so
//! nothing a guest leaves on its global object survives into the next call.
//! A watchdog on the shared host runtime terminates the isolate when the
//! execution budget runs out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{JsRuntime, ModuleCodeString, PollEventLoopOptions, RuntimeOptions, serde_v8, v8};
use host::{
    Bridge, Capabilities, Envelope, GuestFailure, GuestValue, HostServices, Interrupt,
    InterruptSlot, InvocationContext, ResponseMeta,
};

/// A status-carrying failure of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecError {
    pub status: u16,
    pub message: String,
}

impl ExecError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn timeout() -> Self {
        Self::new(504, "execution timeout")
    }

    pub fn is_timeout(&self) -> bool {
        self.status == 504
    }
}

impl From<Interrupt> for ExecError {
    fn from(cause: Interrupt) -> Self {
        match cause {
            Interrupt::Timeout => ExecError::timeout(),
            Interrupt::Thrown { status, message } => ExecError::new(status, message),
        }
    }
}

impl From<GuestFailure> for ExecError {
    fn from(failure: GuestFailure) -> Self {
        ExecError::new(failure.status, failure.message)
    }
}

/// Compiled code plus everything bound to one call.
#[derive(Clone)]
pub struct Invocation {
    /// `reference/name`; scopes storage and routes to a worker.
    pub namespace: String,
    pub code: Arc<str>,
    pub context: InvocationContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// `None` when the handler produced no value.
    pub value: Option<GuestValue>,
    pub meta: ResponseMeta,
}

#[derive(Clone)]
pub struct Executor {
    services: Arc<HostServices>,
    bridge: Bridge,
    budget: Duration,
}

impl Executor {
    /// `bridge` must sit on a multi-thread runtime: the watchdog has to fire
    /// while the calling thread is stuck inside V8.
    pub fn new(services: Arc<HostServices>, bridge: Bridge, budget: Duration) -> Self {
        Self {
            services,
            bridge,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Run `invocation` to completion on the current thread.
    ///
    /// The future is `!Send`; drive it from a current-thread runtime.
    pub async fn run(&self, invocation: &Invocation) -> Result<ExecutionResult, ExecError> {
        let interrupt = InterruptSlot::new();
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![host::extension()],
            ..Default::default()
        });
        let isolate = runtime.v8_isolate().thread_safe_handle();
        let deadline = Instant::now() + self.budget;
        runtime.op_state().borrow_mut().put(
            Capabilities::new(
                invocation.namespace.clone(),
                Arc::clone(&self.services),
                interrupt.clone(),
            )
            .with_isolate(isolate.clone())
            .with_deadline(deadline),
        );

        let watchdog = {
            let interrupt = interrupt.clone();
            let isolate = isolate.clone();
            let budget = self.budget;
            self.bridge.handle().spawn(async move {
                tokio::time::sleep(budget).await;
                interrupt.raise(Interrupt::Timeout);
                isolate.terminate_execution();
            })
        };

        let outcome = drive(&mut runtime, invocation, deadline, &interrupt, &isolate).await;
        watchdog.abort();

        let meta = runtime
            .op_state()
            .borrow_mut()
            .try_take::<Capabilities>()
            .map(|caps| caps.meta)
            .unwrap_or_default();

        // a host call cut short by the deadline can finish before the watchdog
        if Instant::now() >= deadline {
            interrupt.raise(Interrupt::Timeout);
        }
        // a raised interrupt fails the call even if the guest got further
        if let Some(cause) = interrupt.get() {
            return Err(cause.into());
        }
        outcome.map(|value| ExecutionResult { value, meta })
    }
}

async fn drive(
    runtime: &mut JsRuntime,
    invocation: &Invocation,
    deadline: Instant,
    interrupt: &InterruptSlot,
    isolate: &v8::IsolateHandle,
) -> Result<Option<GuestValue>, ExecError> {
    set_invocation_global(runtime, &invocation.context)?;
    runtime
        .execute_script(
            "fn:bootstrap.js",
            ModuleCodeString::from(host::BOOTSTRAP_JS.to_string()),
        )
        .map_err(|err| script_error(&err.to_string()))?;

    let loaded = runtime
        .execute_script(
            "fn:module.js",
            ModuleCodeString::from(wrap_module(&invocation.code)),
        )
        .map_err(|err| script_error(&err.to_string()))?;
    read_envelope(runtime, &loaded)?.into_result()?;

    let pending = runtime
        .execute_script(
            "fn:invoke.js",
            ModuleCodeString::from("globalThis.__fnInvoke()".to_string()),
        )
        .map_err(|err| script_error(&err.to_string()))?;

    // Host calls settle synchronously; the loop only drains microtasks and
    // whatever the guest scheduled itself.
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(
        remaining,
        runtime.run_event_loop(PollEventLoopOptions::default()),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(script_error(&err.to_string())),
        Err(_) => {
            interrupt.raise(Interrupt::Timeout);
            isolate.terminate_execution();
            return Err(ExecError::timeout());
        }
    }

    let settled = settled_value(runtime, &pending)?;
    read_envelope(runtime, &settled)?
        .into_result()
        .map_err(ExecError::from)
}

/// Wrap compiled CommonJS code so `__fnLoad` can locate its handler.
fn wrap_module(code: &str) -> String {
    format!(
        "globalThis.__fnLoad(function (exports, module, require) {{\n\"use strict\";\n{}\n\
         ;return typeof handler === \"function\" ? handler : undefined;\n}});",
        code
    )
}

fn script_error(message: &str) -> ExecError {
    if message.contains("execution terminated") {
        return ExecError::internal("execution interrupted");
    }
    ExecError::internal(message.trim_start_matches("Uncaught ").to_string())
}

fn set_invocation_global(
    runtime: &mut JsRuntime,
    context: &InvocationContext,
) -> Result<(), ExecError> {
    deno_core::scope!(scope, runtime);
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, "__fnInvocation")
        .ok_or_else(|| ExecError::internal("invocation key"))?;
    let value = serde_v8::to_v8(scope, context)
        .map_err(|err| ExecError::internal(format!("invocation to v8: {}", err)))?;
    global.set(scope, key.into(), value);
    Ok(())
}

fn settled_value(
    runtime: &mut JsRuntime,
    pending: &v8::Global<v8::Value>,
) -> Result<v8::Global<v8::Value>, ExecError> {
    deno_core::scope!(scope, runtime);
    let local = v8::Local::new(scope, pending);
    let promise = v8::Local::<v8::Promise>::try_from(local)
        .map_err(|_| ExecError::internal("handler invocation did not produce a promise"))?;
    match promise.state() {
        v8::PromiseState::Fulfilled => {
            let value = promise.result(scope);
            Ok(v8::Global::new(scope, value))
        }
        v8::PromiseState::Rejected => {
            let reason = promise.result(scope);
            Err(ExecError::internal(reason.to_rust_string_lossy(scope)))
        }
        v8::PromiseState::Pending => Err(ExecError::internal("handler promise did not settle")),
    }
}

fn read_envelope(
    runtime: &mut JsRuntime,
    value: &v8::Global<v8::Value>,
) -> Result<Envelope, ExecError> {
    deno_core::scope!(scope, runtime);
    let local = v8::Local::new(scope, value);
    serde_v8::from_v8::<Envelope>(scope, local)
        .map_err(|err| ExecError::internal(format!("unreadable handler result: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_map_to_statuses() {
        assert_eq!(ExecError::from(Interrupt::Timeout), ExecError::new(504, "execution timeout"));
        assert_eq!(
            ExecError::from(Interrupt::Thrown {
                status: 418,
                message: "teapot".into()
            }),
            ExecError::new(418, "teapot")
        );
    }

    #[test]
    fn termination_messages_are_generic() {
        assert_eq!(
            script_error("Uncaught Error: execution terminated"),
            ExecError::internal("execution interrupted")
        );
        assert_eq!(
            script_error("Uncaught SyntaxError: Unexpected token"),
            ExecError::internal("SyntaxError: Unexpected token")
        );
    }

    #[test]
    fn wrapper_returns_top_level_handler() {
        let wrapped = wrap_module("function handler() {}");
        assert!(wrapped.starts_with("globalThis.__fnLoad(function (exports, module, require) {"));
        assert!(wrapped.contains("function handler() {}\n;return typeof handler"));
    }
}
