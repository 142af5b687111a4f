//! Per-plugin JavaScript execution environment.
//!
//! Every invocation gets a fresh QuickJS runtime with a memory ceiling, a
//! stack ceiling, and a wall-clock budget enforced through the engine's
//! interrupt handler. The only way to obtain a context is
//! `SandboxRuntime::execute`, which strips dangerous globals (`eval` and
//! the function-constructor path) and installs exactly the capabilities
//! the plugin's grants cover: `fetch` routes into the hardened HTTP
//! client, timers into the timer registry, `context.emit` into the event
//! bus, `context.call` into the call router, and `context.storage` into
//! the per-plugin store.
//!
//! Execution is pinned to one blocking thread per invocation; async
//! capabilities bridge back into the host runtime with `Handle::block_on`.
//! There is no inner parallelism within a single plugin run.

use crate::calls::CallRouter;
use crate::error::{HostError, HostResult};
use crate::event_bus::EventBus;
use crate::host_log::PluginLog;
use crate::permissions::PermissionGrant;
use crate::secure_fetch::{FetchOptions, SecureFetch};
use crate::storage::PluginStorage;
use crate::timers::{TimerCallback, TimerKind, TimerRegistry};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Runtime};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte cap applied to every log line after formatting.
const MAX_LOG_BYTES: usize = 4096;
/// Safety valve for the microtask pump.
const MAX_PENDING_JOBS: usize = 10_000;

/// What the host wants from this invocation.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Run the default export and collect its artefact.
    Collect,
    /// Deliver an event to `onEvent`.
    Event { topic: String, data: Value },
    /// Tell the plugin its config changed via `onConfigChanged`.
    ConfigChanged,
}

/// Result of a sandbox run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// JSON form of the handler's return value (`null` for undefined).
    pub value: Value,
    /// `subscribedEvents` export, when the module declares one. Overrides
    /// the manifest.
    pub subscribed_events: Option<Vec<String>>,
    /// `exposedMethods` export, when the module declares one.
    pub exposed_methods: Option<Vec<String>>,
}

pub struct SandboxRuntime {
    fetch: Arc<SecureFetch>,
    timers: Arc<TimerRegistry>,
    bus: Arc<EventBus>,
    router: Arc<CallRouter>,
    storage: PluginStorage,
    log: PluginLog,
    memory_limit: usize,
    stack_limit: usize,
    default_timeout: Duration,
}

impl SandboxRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fetch: Arc<SecureFetch>,
        timers: Arc<TimerRegistry>,
        bus: Arc<EventBus>,
        router: Arc<CallRouter>,
        storage: PluginStorage,
        log: PluginLog,
        config: &crate::config::HostConfig,
    ) -> Self {
        Self {
            fetch,
            timers,
            bus,
            router,
            storage,
            log,
            memory_limit: config.sandbox_memory_limit,
            stack_limit: config.sandbox_stack_limit,
            default_timeout: Duration::from_millis(config.sandbox_timeout_ms),
        }
    }

    /// Execute a plugin inside a fresh sandboxed context.
    pub async fn execute(
        &self,
        plugin_id: &str,
        entry_source: &str,
        permissions: HashSet<PermissionGrant>,
        config: Value,
        invocation: Invocation,
        timeout: Option<Duration>,
    ) -> HostResult<ExecutionOutput> {
        let job = SandboxJob {
            plugin_id: plugin_id.to_string(),
            entry_source: entry_source.to_string(),
            permissions,
            config,
            invocation,
            timeout: timeout.unwrap_or(self.default_timeout),
            fetch: Arc::clone(&self.fetch),
            timers: Arc::clone(&self.timers),
            bus: Arc::clone(&self.bus),
            router: Arc::clone(&self.router),
            storage: self.storage.clone(),
            log: self.log.clone(),
            memory_limit: self.memory_limit,
            stack_limit: self.stack_limit,
            handle: tokio::runtime::Handle::current(),
        };

        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| {
                if e.is_panic() {
                    HostError::TaskPanic {
                        message: "sandbox thread panicked".into(),
                    }
                } else {
                    HostError::Cancelled
                }
            })?
    }
}

// ---------------------------------------------------------------------------
// Blocking-thread execution
// ---------------------------------------------------------------------------

struct SandboxJob {
    plugin_id: String,
    entry_source: String,
    permissions: HashSet<PermissionGrant>,
    config: Value,
    invocation: Invocation,
    timeout: Duration,
    fetch: Arc<SecureFetch>,
    timers: Arc<TimerRegistry>,
    bus: Arc<EventBus>,
    router: Arc<CallRouter>,
    storage: PluginStorage,
    log: PluginLog,
    memory_limit: usize,
    stack_limit: usize,
    handle: tokio::runtime::Handle,
}

impl SandboxJob {
    fn run(self) -> HostResult<ExecutionOutput> {
        let runtime = Runtime::new().map_err(|e| HostError::RuntimeInit(e.to_string()))?;
        runtime.set_memory_limit(self.memory_limit);
        runtime.set_max_stack_size(self.stack_limit);

        let interrupted = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + self.timeout;
        {
            let interrupted = Arc::clone(&interrupted);
            runtime.set_interrupt_handler(Some(Box::new(move || {
                if Instant::now() >= deadline {
                    interrupted.store(true, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })));
        }

        let context =
            Context::full(&runtime).map_err(|e| HostError::RuntimeInit(e.to_string()))?;

        // Phase 1: capabilities, prelude, entry module, invocation kick-off.
        // Entries evaluate in strict mode so writes to frozen state throw
        // instead of failing silently.
        let entry = format!("\"use strict\";\n{}", self.entry_source);
        context.with(|ctx| -> HostResult<()> {
            self.install_host_functions(&ctx, deadline)?;
            eval_checked(&ctx, &self.prelude(), &interrupted)?;
            eval_checked(&ctx, &entry, &interrupted)?;
            eval_checked(&ctx, &self.invoke_snippet(), &interrupted)
        })?;

        // Phase 2: pump microtasks outside the context lock until the
        // result promise settles or the budget runs out.
        let mut jobs = 0usize;
        loop {
            let done: bool = context.with(|ctx| {
                ctx.globals().get("__qb_done").unwrap_or(false)
            });
            if done {
                break;
            }
            if Instant::now() >= deadline {
                interrupted.store(true, Ordering::SeqCst);
                return Err(HostError::Timeout);
            }
            if jobs >= MAX_PENDING_JOBS {
                return Err(HostError::JsException(
                    "job queue never drained".into(),
                ));
            }
            match runtime.execute_pending_job() {
                Ok(true) => jobs += 1,
                Ok(false) => break,
                Err(_) => {
                    // The job's exception surfaces through __qb_error.
                    jobs += 1;
                }
            }
        }

        // Cache the flag before clearing the handler, so "interrupted" is
        // always attributable to this invocation.
        let was_interrupted = interrupted.load(Ordering::SeqCst);
        runtime.set_interrupt_handler(None);
        if was_interrupted {
            return Err(HostError::Timeout);
        }

        // Phase 3: harvest.
        context.with(|ctx| -> HostResult<ExecutionOutput> {
            let globals = ctx.globals();
            let done: bool = globals.get("__qb_done").unwrap_or(false);
            let error: Option<String> = globals.get("__qb_error").unwrap_or(None);
            let result: Option<String> = globals.get("__qb_result").unwrap_or(None);

            if let Some(message) = error {
                return Err(classify_js_error(message, false));
            }
            if !done {
                return Err(HostError::JsException(
                    "handler promise never settled".into(),
                ));
            }

            let value = match result {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| HostError::JsException(format!("unserialisable result: {e}")))?,
                None => Value::Null,
            };

            let subscribed_events = read_export_list(&ctx, "subscribedEvents")?;
            let exposed_methods = read_export_list(&ctx, "exposedMethods")?;

            Ok(ExecutionOutput {
                value,
                subscribed_events,
                exposed_methods,
            })
        })
    }

    // -- host functions -----------------------------------------------------

    fn install_host_functions(&self, ctx: &Ctx<'_>, deadline: Instant) -> HostResult<()> {
        let globals = ctx.globals();
        let init = |e: rquickjs::Error| HostError::RuntimeInit(e.to_string());

        // Logging is always available.
        {
            let log = self.log.clone();
            let plugin_id = self.plugin_id.clone();
            globals
                .set(
                    "__qb_console",
                    Function::new(ctx.clone(), move |level: String, message: String| {
                        let level = match level.as_str() {
                            "warn" | "error" => level,
                            _ => "info".to_string(),
                        };
                        log.push(&level, &plugin_id, &truncate_utf8(&message, MAX_LOG_BYTES));
                    })
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        // context.emit: a failed enqueue raises in the sandbox.
        {
            let bus = Arc::clone(&self.bus);
            let plugin_id = self.plugin_id.clone();
            globals
                .set(
                    "__qb_emit",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>, action: String, data_json: String| {
                            let data: Value = serde_json::from_str(&data_json)
                                .unwrap_or(Value::Null);
                            bus.emit_sync(&plugin_id, &action, data).map_err(|e| {
                                throw_host_error(&ctx, &e)
                            })
                        },
                    )
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        // context.call: routed through the dispatcher, envelope back.
        {
            let router = Arc::clone(&self.router);
            let plugin_id = self.plugin_id.clone();
            let handle = self.handle.clone();
            globals
                .set(
                    "__qb_call",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>,
                              target: String,
                              method: String,
                              params_json: String|
                              -> rquickjs::Result<String> {
                            let params: Value =
                                serde_json::from_str(&params_json).unwrap_or(Value::Null);
                            let outcome = handle.block_on(router.call(
                                &plugin_id, &target, &method, params, 0,
                            ));
                            match outcome {
                                Ok(envelope) => Ok(serde_json::to_string(&envelope)
                                    .unwrap_or_else(|_| "{}".to_string())),
                                Err(e) => Err(throw_host_error(&ctx, &e)),
                            }
                        },
                    )
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        // fetch requires the network grant.
        if self.permissions.contains(&PermissionGrant::Network) {
            let fetch = Arc::clone(&self.fetch);
            let plugin_id = self.plugin_id.clone();
            let handle = self.handle.clone();
            globals
                .set(
                    "__qb_fetch",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>,
                              url: String,
                              options_json: Option<String>|
                              -> rquickjs::Result<String> {
                            if Instant::now() >= deadline {
                                return Err(throw_host_error(&ctx, &HostError::Timeout));
                            }
                            let options: FetchOptions = match options_json.as_deref() {
                                Some(raw) if raw != "null" => serde_json::from_str(raw)
                                    .map_err(|e| {
                                        throw_host_error(
                                            &ctx,
                                            &HostError::InvalidUrl(format!("bad options: {e}")),
                                        )
                                    })?,
                                _ => FetchOptions::default(),
                            };
                            let outcome =
                                handle.block_on(fetch.fetch(&plugin_id, &url, options));
                            match outcome {
                                Ok(response) => Ok(serde_json::to_string(&response)
                                    .unwrap_or_else(|_| "{}".to_string())),
                                Err(e) => Err(throw_host_error(&ctx, &e)),
                            }
                        },
                    )
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        // Timers require the timer grant. The JS callback cannot
        // outlive this invocation's context, so a fired timer surfaces as
        // a `system:timer_fired` event instead.
        if self.permissions.contains(&PermissionGrant::Timer) {
            let timers = Arc::clone(&self.timers);
            let bus = Arc::clone(&self.bus);
            let plugin_id = self.plugin_id.clone();
            let handle = self.handle.clone();
            globals
                .set(
                    "__qb_set_timer",
                    Function::new(ctx.clone(), move |kind: String, delay_ms: f64| -> f64 {
                        let kind = if kind == "interval" {
                            TimerKind::Interval
                        } else {
                            TimerKind::Timeout
                        };
                        // A zero-delay interval would spin the host.
                        let floor = if kind == TimerKind::Interval { 10.0 } else { 0.0 };
                        let delay = Duration::from_millis(delay_ms.max(floor) as u64);
                        let bus = Arc::clone(&bus);
                        let owner = plugin_id.clone();
                        let registry = Arc::clone(&timers);
                        handle.block_on(async move {
                            let id = registry.reserve(&owner).await;
                            let fired_owner = owner.clone();
                            let callback: TimerCallback = Arc::new(move || {
                                let _ = bus.emit_system_sync(
                                    "timer_fired",
                                    serde_json::json!({
                                        "pluginId": fired_owner,
                                        "timerId": id,
                                    }),
                                );
                            });
                            registry.activate(id, kind, delay, callback).await;
                            id as f64
                        })
                    })
                    .map_err(init)?,
                )
                .map_err(init)?;

            let timers = Arc::clone(&self.timers);
            let handle = self.handle.clone();
            globals
                .set(
                    "__qb_clear_timer",
                    Function::new(ctx.clone(), move |id: f64| -> bool {
                        handle.block_on(timers.cancel(id as u64))
                    })
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        // Storage requires the storage grant.
        if self.permissions.contains(&PermissionGrant::Storage) {
            let storage = self.storage.clone();
            let plugin_id = self.plugin_id.clone();
            globals
                .set(
                    "__qb_storage_get",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>, key: String| -> rquickjs::Result<Option<String>> {
                            match storage.kv_get(&plugin_id, &key) {
                                Ok(value) => Ok(value.map(|v| v.to_string())),
                                Err(e) => Err(throw_host_error(&ctx, &e)),
                            }
                        },
                    )
                    .map_err(init)?,
                )
                .map_err(init)?;

            let storage = self.storage.clone();
            let plugin_id = self.plugin_id.clone();
            globals
                .set(
                    "__qb_storage_set",
                    Function::new(
                        ctx.clone(),
                        move |ctx: Ctx<'_>, key: String, value_json: String| {
                            let value: Value =
                                serde_json::from_str(&value_json).unwrap_or(Value::Null);
                            storage
                                .kv_set(&plugin_id, &key, &value)
                                .map_err(|e| throw_host_error(&ctx, &e))
                        },
                    )
                    .map_err(init)?,
                )
                .map_err(init)?;

            let storage = self.storage.clone();
            let plugin_id = self.plugin_id.clone();
            globals
                .set(
                    "__qb_storage_remove",
                    Function::new(ctx.clone(), move |ctx: Ctx<'_>, key: String| {
                        storage
                            .kv_remove(&plugin_id, &key)
                            .map_err(|e| throw_host_error(&ctx, &e))
                    })
                    .map_err(init)?,
                )
                .map_err(init)?;
        }

        Ok(())
    }

    // -- generated JS -------------------------------------------------------

    /// The fixed part of every context: dangerous globals stripped, codec
    /// shims, console, and the frozen `context` object.
    fn prelude(&self) -> String {
        let plugin_id_json = Value::String(self.plugin_id.clone()).to_string();
        let config_json_literal =
            Value::String(self.config.to_string()).to_string();
        let has_network = self.permissions.contains(&PermissionGrant::Network);
        let has_timer = self.permissions.contains(&PermissionGrant::Timer);
        let has_storage = self.permissions.contains(&PermissionGrant::Storage);

        let mut js = String::with_capacity(8 * 1024);
        js.push_str(
            r#""use strict";
class PluginError extends Error {
  constructor(message, code) {
    super(message);
    this.name = "PluginError";
    this.code = code === undefined ? "PluginError" : code;
  }
}
globalThis.PluginError = PluginError;

globalThis.eval = undefined;
(() => {
  const fp = Object.getPrototypeOf(function () {});
  Object.defineProperty(fp, "constructor", {
    value: undefined, writable: false, configurable: false,
  });
})();
globalThis.Function = undefined;

const __qb_deep_freeze = (value) => {
  if (value && typeof value === "object") {
    for (const key of Object.getOwnPropertyNames(value)) {
      __qb_deep_freeze(value[key]);
    }
    Object.freeze(value);
  }
  return value;
};

const __qb_fmt = (value, depth) => {
  if (value === null) return "null";
  const t = typeof value;
  if (t === "string") return value;
  if (t === "number" || t === "boolean" || t === "bigint") return String(value);
  if (t === "undefined") return "undefined";
  if (t === "function") return "[function]";
  if (t === "symbol") return "[symbol]";
  if (depth <= 0) return Array.isArray(value) ? "[...]" : "{...}";
  if (Array.isArray(value)) {
    const items = value.slice(0, 32).map((x) => __qb_fmt(x, depth - 1));
    if (value.length > 32) items.push("+" + (value.length - 32) + " more");
    return "[" + items.join(", ") + "]";
  }
  try {
    const keys = Object.keys(value).slice(0, 32);
    return "{" + keys.map((k) => k + ": " + __qb_fmt(value[k], depth - 1)).join(", ") + "}";
  } catch (e) {
    return "[object]";
  }
};
globalThis.console = {
  log: (...args) => __qb_console("info", args.map((a) => __qb_fmt(a, 4)).join(" ")),
  warn: (...args) => __qb_console("warn", args.map((a) => __qb_fmt(a, 4)).join(" ")),
  error: (...args) => __qb_console("error", args.map((a) => __qb_fmt(a, 4)).join(" ")),
};

const __QB_CODEC_MAX = 1048576;
globalThis.TextEncoder = class TextEncoder {
  encode(input) {
    const s = String(input === undefined ? "" : input);
    if (s.length > __QB_CODEC_MAX) {
      throw new PluginError("TextEncoder input exceeds 1 MiB", "UnsupportedApi");
    }
    const out = [];
    for (const ch of s) {
      const cp = ch.codePointAt(0);
      if (cp < 0x80) out.push(cp);
      else if (cp < 0x800) {
        out.push(0xc0 | (cp >> 6), 0x80 | (cp & 0x3f));
      } else if (cp < 0x10000) {
        out.push(0xe0 | (cp >> 12), 0x80 | ((cp >> 6) & 0x3f), 0x80 | (cp & 0x3f));
      } else {
        out.push(
          0xf0 | (cp >> 18), 0x80 | ((cp >> 12) & 0x3f),
          0x80 | ((cp >> 6) & 0x3f), 0x80 | (cp & 0x3f)
        );
      }
    }
    return Uint8Array.from(out);
  }
};
globalThis.TextDecoder = class TextDecoder {
  decode(input) {
    if (input === undefined) return "";
    const bytes = input instanceof Uint8Array ? input : Uint8Array.from(input);
    if (bytes.length > __QB_CODEC_MAX) {
      throw new PluginError("TextDecoder input exceeds 1 MiB", "UnsupportedApi");
    }
    let out = "";
    let i = 0;
    while (i < bytes.length) {
      const b = bytes[i];
      let cp, extra;
      if (b < 0x80) { cp = b; extra = 0; }
      else if ((b & 0xe0) === 0xc0) { cp = b & 0x1f; extra = 1; }
      else if ((b & 0xf0) === 0xe0) { cp = b & 0x0f; extra = 2; }
      else if ((b & 0xf8) === 0xf0) { cp = b & 0x07; extra = 3; }
      else { cp = 0xfffd; extra = 0; }
      for (let j = 0; j < extra; j++) {
        const nb = bytes[i + 1 + j];
        if (nb === undefined || (nb & 0xc0) !== 0x80) { cp = 0xfffd; extra = j; break; }
        cp = (cp << 6) | (nb & 0x3f);
      }
      out += String.fromCodePoint(cp);
      i += 1 + extra;
    }
    return out;
  }
};
"#,
        );

        js.push_str(&format!(
            "const __qb_plugin_id = {plugin_id_json};\n\
             const __qb_config = __qb_deep_freeze(JSON.parse({config_json_literal}));\n"
        ));

        if has_network {
            js.push_str(
                r#"globalThis.fetch = (url, options) => {
  const raw = __qb_fetch(String(url), options === undefined ? null : JSON.stringify(options));
  const r = JSON.parse(raw);
  return Promise.resolve({
    status: r.status,
    ok: r.status >= 200 && r.status < 300,
    headers: r.headers,
    text: () => Promise.resolve(r.body),
    json: () => Promise.resolve(JSON.parse(r.body)),
  });
};
"#,
            );
        }

        if has_timer {
            js.push_str(
                r#"globalThis.setTimeout = (_fn, ms) => __qb_set_timer("timeout", Number(ms) || 0);
globalThis.setInterval = (_fn, ms) => __qb_set_timer("interval", Number(ms) || 0);
globalThis.clearTimeout = (id) => { __qb_clear_timer(Number(id) || 0); };
globalThis.clearInterval = (id) => { __qb_clear_timer(Number(id) || 0); };
"#,
            );
        }

        js.push_str(
            r#"const __qb_context = {
  pluginId: __qb_plugin_id,
  config: __qb_config,
  log: (level, message) => __qb_console(String(level), String(message)),
  emit: (event, data) => {
    __qb_emit(String(event), JSON.stringify(data === undefined ? null : data));
  },
  call: (target, method, params) => {
    const raw = __qb_call(
      String(target), String(method),
      JSON.stringify(params === undefined ? null : params)
    );
    return JSON.parse(raw);
  },
};
"#,
        );

        if has_storage {
            js.push_str(
                r#"__qb_context.storage = {
  get: (key) => {
    const raw = __qb_storage_get(String(key));
    return raw === undefined || raw === null ? null : JSON.parse(raw);
  },
  set: (key, value) => {
    __qb_storage_set(String(key), JSON.stringify(value === undefined ? null : value));
  },
  remove: (key) => { __qb_storage_remove(String(key)); },
};
"#,
            );
        }

        js.push_str(
            "Object.freeze(__qb_context);\n\
             globalThis.__qb_context = __qb_context;\n\
             globalThis.module = { exports: {} };\n\
             globalThis.exports = globalThis.module.exports;\n",
        );
        js
    }

    /// Kick off the requested export and funnel the settled result into
    /// `__qb_done` / `__qb_result` / `__qb_error`.
    fn invoke_snippet(&self) -> String {
        let body = match &self.invocation {
            Invocation::Collect => r#"
  const handler = typeof m.default === "function"
    ? m.default
    : (typeof m === "function" ? m : null);
  run = () => {
    if (!handler) {
      throw new PluginError("plugin exports no default handler");
    }
    return handler(globalThis.__qb_context);
  };"#
                .to_string(),
            Invocation::Event { topic, data } => {
                let topic_json = Value::String(topic.clone()).to_string();
                let data_json = data.to_string();
                format!(
                    r#"
  const topic = {topic_json};
  const data = {data_json};
  run = () => typeof m.onEvent === "function"
    ? m.onEvent(topic, data, globalThis.__qb_context)
    : null;"#
                )
            }
            Invocation::ConfigChanged => r#"
  run = () => typeof m.onConfigChanged === "function"
    ? m.onConfigChanged(globalThis.__qb_context.config, globalThis.__qb_context)
    : null;"#
                .to_string(),
        };

        format!(
            r#""use strict";
globalThis.__qb_done = false;
globalThis.__qb_result = undefined;
globalThis.__qb_error = undefined;
(() => {{
  const m = globalThis.module.exports;
  let run;
  {body}
  Promise.resolve()
    .then(() => run())
    .then(
      (r) => {{
        try {{
          const text = JSON.stringify(r === undefined ? null : r);
          globalThis.__qb_result = text === undefined ? "null" : text;
        }} catch (e) {{
          globalThis.__qb_error = "unserialisable result: " + String(e && e.message ? e.message : e);
        }}
        globalThis.__qb_done = true;
      }},
      (e) => {{
        globalThis.__qb_error = String(e && e.message ? e.message : e);
        globalThis.__qb_done = true;
      }}
    );
}})();"#
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Throw a host error into the sandbox as `"{Code}: {message}"`.
fn throw_host_error(ctx: &Ctx<'_>, error: &HostError) -> rquickjs::Error {
    rquickjs::Exception::throw_message(ctx, &format!("{}: {}", error.code(), error))
}

fn eval_checked(ctx: &Ctx<'_>, source: &str, interrupted: &AtomicBool) -> HostResult<()> {
    ctx.eval::<(), _>(source)
        .catch(ctx)
        .map_err(|e| classify_js_error(e.to_string(), interrupted.load(Ordering::SeqCst)))
}

/// Map an engine failure to the runtime taxonomy. Interruption wins over
/// whatever the engine reported.
fn classify_js_error(message: String, was_interrupted: bool) -> HostError {
    if was_interrupted {
        return HostError::Timeout;
    }
    let lower = message.to_lowercase();
    if lower.contains("out of memory") {
        HostError::OutOfMemory
    } else if lower.contains("stack overflow") {
        HostError::StackOverflow
    } else if lower.contains("interrupted") {
        HostError::Timeout
    } else {
        HostError::JsException(message)
    }
}

/// Read an optional string-array export (`subscribedEvents`,
/// `exposedMethods`) from the evaluated module.
fn read_export_list(ctx: &Ctx<'_>, name: &str) -> HostResult<Option<Vec<String>>> {
    let script = format!(
        r#"(() => {{
  const m = globalThis.module.exports;
  const list = m && m["{name}"];
  if (!Array.isArray(list)) return null;
  return JSON.stringify(list.filter((x) => typeof x === "string"));
}})()"#
    );
    let raw: Option<String> = ctx
        .eval(script.as_str())
        .catch(ctx)
        .map_err(|e| HostError::JsException(e.to_string()))?;
    match raw {
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| HostError::JsException(format!("bad {name} export: {e}"))),
        None => Ok(None),
    }
}

/// Byte-capped copy that never splits a UTF-8 character.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::parse_permissions;
    use serde_json::json;

    struct Fixture {
        sandbox: SandboxRuntime,
        bus: Arc<EventBus>,
        timers: Arc<TimerRegistry>,
        log: PluginLog,
        _data_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let config = crate::config::HostConfig::default();
        let fetch = Arc::new(SecureFetch::for_tests(8, 1024 * 1024));
        let timers = Arc::new(TimerRegistry::new());
        let bus = Arc::new(EventBus::new(64, 4));
        let checker = Arc::new(crate::permissions::PermissionChecker::new());
        checker.register(
            "test-plugin",
            parse_permissions(&["call:target:get_usage".into()]).unwrap(),
        );
        let router = Arc::new(CallRouter::new(checker));
        router.start_dispatcher();
        router.register_methods("target", HashSet::from(["get_usage".to_string()]));
        let data_dir = tempfile::TempDir::new().unwrap();
        let storage = PluginStorage::new(data_dir.path().to_path_buf());
        let log = PluginLog::new();
        let sandbox = SandboxRuntime::new(
            fetch,
            Arc::clone(&timers),
            Arc::clone(&bus),
            router,
            storage,
            log.clone(),
            &config,
        );
        Fixture {
            sandbox,
            bus,
            timers,
            log,
            _data_dir: data_dir,
        }
    }

    fn grants(raw: &[&str]) -> HashSet<PermissionGrant> {
        parse_permissions(&raw.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    async fn run(
        fixture: &Fixture,
        source: &str,
        permissions: HashSet<PermissionGrant>,
        config: Value,
    ) -> HostResult<ExecutionOutput> {
        fixture
            .sandbox
            .execute(
                "test-plugin",
                source,
                permissions,
                config,
                Invocation::Collect,
                Some(Duration::from_secs(2)),
            )
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn default_handler_result_round_trips() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = (ctx) => ({ used: 5, limit: 10, plugin: ctx.pluginId });"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(
            output.value,
            json!({"used": 5, "limit": 10, "plugin": "test-plugin"})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_handler_is_awaited() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = async () => {
                 const x = await Promise.resolve(21);
                 return x * 2;
               };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value, json!(42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_default_handler_is_js_exception() {
        let fixture = fixture();
        let err = run(&fixture, "module.exports = {};", grants(&[]), json!({}))
            .await
            .unwrap_err();
        match err {
            HostError::JsException(message) => assert!(message.contains("default handler")),
            other => panic!("expected JsException, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn thrown_errors_carry_their_message() {
        let fixture = fixture();
        let err = run(
            &fixture,
            r#"module.exports.default = () => { throw new PluginError("quota api moved"); };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap_err();
        match err {
            HostError::JsException(message) => assert!(message.contains("quota api moved")),
            other => panic!("expected JsException, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn eval_and_function_constructor_are_stripped() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = () => ({
                 evalType: typeof eval,
                 fnType: typeof Function,
                 ctorPath: String(({}).constructor.constructor),
               });"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value["evalType"], "undefined");
        assert_eq!(output.value["fnType"], "undefined");
        assert_eq!(output.value["ctorPath"], "undefined");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn infinite_loop_times_out() {
        let fixture = fixture();
        let err = fixture
            .sandbox
            .execute(
                "test-plugin",
                "module.exports.default = () => { while (true) {} };",
                grants(&[]),
                json!({}),
                Invocation::Collect,
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Timeout");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runaway_recursion_is_stack_overflow() {
        let fixture = fixture();
        let err = run(
            &fixture,
            "const f = (n) => f(n + 1) + 1; module.exports.default = () => f(0);",
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "StackOverflow");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unbounded_allocation_is_out_of_memory() {
        let fixture = fixture();
        let err = run(
            &fixture,
            r#"module.exports.default = () => {
                 const chunks = [];
                 while (true) { chunks.push("x".repeat(1 << 20)); }
               };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(err, HostError::OutOfMemory | HostError::Timeout),
            "expected OutOfMemory (or Timeout on slow hosts), got {err:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn config_is_deep_frozen() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = (ctx) => {
                 let threw = false;
                 try { ctx.config.nested.value = 99; } catch (e) { threw = true; }
                 return { threw, value: ctx.config.nested.value };
               };"#,
            grants(&[]),
            json!({"nested": {"value": 7}}),
        )
        .await
        .unwrap();
        assert_eq!(output.value, json!({"threw": true, "value": 7}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_is_absent_without_network_grant() {
        let fixture = fixture();
        let output = run(
            &fixture,
            "module.exports.default = () => typeof fetch;",
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value, json!("undefined"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_round_trips_through_secure_client() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/quota")
            .with_status(200)
            .with_body(r#"{"used": 3}"#)
            .create_async()
            .await;

        let fixture = fixture();
        let source = format!(
            r#"module.exports.default = async () => {{
                 const response = await fetch("{}/quota");
                 const data = await response.json();
                 return {{ ok: response.ok, used: data.used }};
               }};"#,
            server.url()
        );
        let output = run(&fixture, &source, grants(&["network"]), json!({}))
            .await
            .unwrap();
        assert_eq!(output.value, json!({"ok": true, "used": 3}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_fetch_raises_coded_exception() {
        let fixture = fixture();
        // The test fixture allows private addresses, but scheme gating is
        // still active.
        let err = run(
            &fixture,
            r#"module.exports.default = async () => { await fetch("file:///etc/passwd"); };"#,
            grants(&["network"]),
            json!({}),
        )
        .await
        .unwrap_err();
        match err {
            HostError::JsException(message) => assert!(message.contains("InvalidUrl")),
            other => panic!("expected JsException, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn console_writes_into_the_ring_buffer() {
        let fixture = fixture();
        run(
            &fixture,
            r#"module.exports.default = () => {
                 console.log("usage", { used: 1, nested: { deep: [1, 2, 3] } });
                 console.error("bad day");
                 return null;
               };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();

        let entries = fixture.log.recent(Some("test-plugin"), 10);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].message.contains("used: 1"));
        assert_eq!(entries[1].level, "error");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emit_publishes_on_the_bus() {
        let fixture = fixture();
        run(
            &fixture,
            r#"module.exports.default = (ctx) => { ctx.emit("data_ready", { n: 1 }); return null; };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(fixture.bus.stats().await.events_published, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emit_with_bad_action_raises() {
        let fixture = fixture();
        let err = run(
            &fixture,
            r#"module.exports.default = (ctx) => { ctx.emit("NotSnake", 1); return null; };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap_err();
        match err {
            HostError::JsException(message) => assert!(message.contains("UnsupportedApi")),
            other => panic!("expected JsException, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_returns_interim_envelope() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = (ctx) => ctx.call("target", "get_usage", { a: 1 });"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value["status"], "not_supported");
        assert_eq!(output.value["success"], json!(false));
        assert_eq!(output.value["max_depth"], json!(crate::calls::MAX_CALL_DEPTH));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unauthorised_call_raises_permission_denied() {
        let fixture = fixture();
        let err = run(
            &fixture,
            r#"module.exports.default = (ctx) => ctx.call("target", "forbidden", null);"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap_err();
        match err {
            HostError::JsException(message) => assert!(message.contains("PermissionDenied")),
            other => panic!("expected JsException, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timers_register_and_cancel_through_the_registry() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = () => {
                 const keep = setTimeout(() => {}, 60000);
                 const gone = setTimeout(() => {}, 60000);
                 clearTimeout(gone);
                 return { keep, gone };
               };"#,
            grants(&["timer"]),
            json!({}),
        )
        .await
        .unwrap();

        let live = fixture.timers.ids_for("test-plugin").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0] as f64, output.value["keep"].as_f64().unwrap());
        fixture.timers.cancel_all_for("test-plugin").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timers_are_absent_without_grant() {
        let fixture = fixture();
        let output = run(
            &fixture,
            "module.exports.default = () => typeof setTimeout;",
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value, json!("undefined"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn storage_round_trips_with_grant() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = (ctx) => {
                 ctx.storage.set("checkpoint", { at: 5 });
                 const read = ctx.storage.get("checkpoint");
                 ctx.storage.remove("checkpoint");
                 return { read, afterRemove: ctx.storage.get("checkpoint") };
               };"#,
            grants(&["storage"]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value, json!({"read": {"at": 5}, "afterRemove": null}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn text_codecs_round_trip() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports.default = () => {
                 const bytes = new TextEncoder().encode("héllo €");
                 const text = new TextDecoder().decode(bytes);
                 return { text, len: bytes.length };
               };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.value["text"], "héllo €");
        // 1 + 2 + 4×1 + 1 + 3 bytes.
        assert_eq!(output.value["len"], json!(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn on_event_receives_topic_and_data() {
        let fixture = fixture();
        let output = fixture
            .sandbox
            .execute(
                "test-plugin",
                r#"module.exports = {
                     default: () => null,
                     onEvent: (topic, data) => ({ topic, doubled: data.n * 2 }),
                   };"#,
                grants(&[]),
                json!({}),
                Invocation::Event {
                    topic: "plugin:other:data_updated".into(),
                    data: json!({"n": 4}),
                },
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(
            output.value,
            json!({"topic": "plugin:other:data_updated", "doubled": 8})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_on_event_is_a_null_no_op() {
        let fixture = fixture();
        let output = fixture
            .sandbox
            .execute(
                "test-plugin",
                "module.exports.default = () => 1;",
                grants(&[]),
                json!({}),
                Invocation::Event {
                    topic: "system:tick".into(),
                    data: json!(null),
                },
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(output.value, Value::Null);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn on_config_changed_sees_frozen_config() {
        let fixture = fixture();
        let output = fixture
            .sandbox
            .execute(
                "test-plugin",
                r#"module.exports = {
                     default: () => null,
                     onConfigChanged: (config) => config.threshold,
                   };"#,
                grants(&[]),
                json!({"threshold": 80}),
                Invocation::ConfigChanged,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert_eq!(output.value, json!(80));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn module_export_lists_are_harvested() {
        let fixture = fixture();
        let output = run(
            &fixture,
            r#"module.exports = {
                 default: () => null,
                 subscribedEvents: ["system:tick", "plugin:other:done", 42],
                 exposedMethods: ["get_usage"],
               };"#,
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(
            output.subscribed_events,
            Some(vec!["system:tick".to_string(), "plugin:other:done".to_string()])
        );
        assert_eq!(output.exposed_methods, Some(vec!["get_usage".to_string()]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn absent_export_lists_are_none() {
        let fixture = fixture();
        let output = run(
            &fixture,
            "module.exports.default = () => null;",
            grants(&[]),
            json!({}),
        )
        .await
        .unwrap();
        assert_eq!(output.subscribed_events, None);
        assert_eq!(output.exposed_methods, None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_utf8("short", 100), "short");
        let s = "ééééé"; // 2 bytes each
        let out = truncate_utf8(s, 5);
        assert!(out.starts_with("éé"));
        assert!(!out.contains('\u{fffd}'));
        assert!(out.ends_with("..."));
    }
}
