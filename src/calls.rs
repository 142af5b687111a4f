//! Permission-gated cross-plugin call routing.
//!
//! A plugin may invoke a method another plugin exposes, if its manifest
//! declares `call:{target}:{method}` and the call chain is shallower than
//! the depth cap. The router answers with a small JSON envelope. Executing
//! the callee needs a persistent sandbox mode that does not exist yet, so
//! a fully authorised call currently reports `status: "not_supported"`;
//! the routing, permission, and depth plumbing is real, the dispatch is
//! the documented interim.
//!
//! Requests travel over a channel consumed by a dispatcher task started
//! with the host; stopping it is terminal because the receive end is
//! consumed (intentional: the host never restarts half-torn-down).

use crate::error::{HostError, HostResult};
use crate::permissions::{PermissionChecker, PermissionGrant};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Longest allowed caller chain.
pub const MAX_CALL_DEPTH: u32 = 3;

/// How long a caller waits on the dispatcher before reporting contention.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Envelope returned to the calling plugin. Field names are the wire
/// contract plugins read (`envelope.call_depth` etc.); serde must emit
/// them verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct CallEnvelope {
    pub success: bool,
    pub status: String,
    pub target: String,
    pub method: String,
    pub call_depth: u32,
    pub max_depth: u32,
    pub message: String,
}

impl CallEnvelope {
    fn failure(status: &str, target: &str, method: &str, depth: u32, message: String) -> Self {
        Self {
            success: false,
            status: status.to_string(),
            target: target.to_string(),
            method: method.to_string(),
            call_depth: depth,
            max_depth: MAX_CALL_DEPTH,
            message,
        }
    }
}

struct CallRequest {
    caller: String,
    target: String,
    method: String,
    call_depth: u32,
    reply: oneshot::Sender<HostResult<CallEnvelope>>,
}

pub struct CallRouter {
    checker: Arc<PermissionChecker>,
    /// target plugin id → methods it exposes.
    methods: RwLock<HashMap<String, HashSet<String>>>,
    tx: mpsc::Sender<CallRequest>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<CallRequest>>>,
    dispatcher: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CallRouter {
    pub fn new(checker: Arc<PermissionChecker>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            checker,
            methods: RwLock::new(HashMap::new()),
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            dispatcher: parking_lot::Mutex::new(None),
        }
    }

    // -- method registry ----------------------------------------------------

    pub fn register_methods(&self, plugin_id: &str, methods: HashSet<String>) {
        let mut map = self.methods.write().unwrap_or_else(|e| e.into_inner());
        map.insert(plugin_id.to_string(), methods);
    }

    pub fn unregister_methods(&self, plugin_id: &str) {
        let mut map = self.methods.write().unwrap_or_else(|e| e.into_inner());
        map.remove(plugin_id);
    }

    fn method_exposed(&self, target: &str, method: &str) -> Option<bool> {
        let map = self.methods.read().unwrap_or_else(|e| e.into_inner());
        map.get(target).map(|set| set.contains(method))
    }

    // -- routing ------------------------------------------------------------

    /// Synchronous routing decision: permission (non-blocking check), then
    /// depth, then the method registry.
    fn route(
        &self,
        caller: &str,
        target: &str,
        method: &str,
        call_depth: u32,
    ) -> HostResult<CallEnvelope> {
        let grant = PermissionGrant::Call {
            target: target.to_string(),
            method: method.to_string(),
        };
        if !self.checker.check_nonblocking(caller, &grant)? {
            return Err(HostError::PermissionDenied {
                plugin_id: caller.to_string(),
                capability: grant.to_string(),
            });
        }

        if call_depth >= MAX_CALL_DEPTH {
            return Err(HostError::CallDepthExceeded {
                depth: call_depth,
                max: MAX_CALL_DEPTH,
            });
        }

        let envelope = match self.method_exposed(target, method) {
            None => CallEnvelope::failure(
                "unknown_target",
                target,
                method,
                call_depth,
                format!("plugin \"{target}\" is not loaded"),
            ),
            Some(false) => CallEnvelope::failure(
                "unknown_method",
                target,
                method,
                call_depth,
                format!("plugin \"{target}\" does not expose \"{method}\""),
            ),
            Some(true) => CallEnvelope::failure(
                "not_supported",
                target,
                method,
                call_depth,
                "cross-plugin call execution requires a persistent sandbox; not available yet"
                    .to_string(),
            ),
        };
        Ok(envelope)
    }

    /// Queue a call through the dispatcher and await its envelope.
    /// `params` is accepted for forward compatibility with real dispatch;
    /// the interim envelope does not carry results.
    pub async fn call(
        &self,
        caller: &str,
        target: &str,
        method: &str,
        _params: Value,
        call_depth: u32,
    ) -> HostResult<CallEnvelope> {
        let (reply, response) = oneshot::channel();
        let request = CallRequest {
            caller: caller.to_string(),
            target: target.to_string(),
            method: method.to_string(),
            call_depth,
            reply,
        };
        self.tx
            .try_send(request)
            .map_err(|_| HostError::LockContention("call dispatcher"))?;

        match tokio::time::timeout(DISPATCH_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(HostError::LockContention("call dispatcher")),
        }
    }

    // -- dispatcher ---------------------------------------------------------

    /// Start the dispatcher exactly once. Stop is terminal.
    pub fn start_dispatcher(self: &Arc<Self>) -> bool {
        let Some(mut rx) = self.rx.lock().take() else {
            tracing::warn!("call dispatcher already started once; ignoring");
            return false;
        };
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let outcome = router.route(
                    &request.caller,
                    &request.target,
                    &request.method,
                    request.call_depth,
                );
                let _ = request.reply.send(outcome);
            }
        });
        *self.dispatcher.lock() = Some(handle);
        true
    }

    pub fn stop_dispatcher(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::parse_permissions;
    use serde_json::json;

    fn router_with_grant(caller: &str, grant: &str) -> Arc<CallRouter> {
        let checker = Arc::new(PermissionChecker::new());
        checker.register(caller, parse_permissions(&[grant.to_string()]).unwrap());
        let router = Arc::new(CallRouter::new(checker));
        router.start_dispatcher();
        router
    }

    #[tokio::test]
    async fn authorised_call_reports_not_supported() {
        let router = router_with_grant("caller", "call:target:get_usage");
        router.register_methods("target", HashSet::from(["get_usage".to_string()]));

        let envelope = router
            .call("caller", "target", "get_usage", json!({}), 0)
            .await
            .unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.status, "not_supported");
        assert_eq!(envelope.target, "target");
        assert_eq!(envelope.method, "get_usage");
        assert_eq!(envelope.max_depth, MAX_CALL_DEPTH);
    }

    #[tokio::test]
    async fn missing_permission_is_denied() {
        let router = router_with_grant("caller", "call:target:get_usage");
        router.register_methods("target", HashSet::from(["other".to_string()]));

        let err = router
            .call("caller", "target", "other", json!({}), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PermissionDenied");

        let err = router
            .call("stranger", "target", "get_usage", json!({}), 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PermissionDenied");
    }

    #[tokio::test]
    async fn depth_cap_is_enforced() {
        let router = router_with_grant("caller", "call:target:m");
        router.register_methods("target", HashSet::from(["m".to_string()]));

        for depth in 0..MAX_CALL_DEPTH {
            assert!(router.call("caller", "target", "m", json!({}), depth).await.is_ok());
        }
        let err = router
            .call("caller", "target", "m", json!({}), MAX_CALL_DEPTH)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CallDepthExceeded");
    }

    #[tokio::test]
    async fn unknown_target_and_method_statuses() {
        let router = router_with_grant("caller", "call:ghost:m");
        let envelope = router
            .call("caller", "ghost", "m", json!({}), 0)
            .await
            .unwrap();
        assert_eq!(envelope.status, "unknown_target");

        let router = router_with_grant("caller", "call:target:m");
        router.register_methods("target", HashSet::new());
        let envelope = router
            .call("caller", "target", "m", json!({}), 0)
            .await
            .unwrap();
        assert_eq!(envelope.status, "unknown_method");
    }

    #[tokio::test]
    async fn unregister_methods_turns_target_unknown() {
        let router = router_with_grant("caller", "call:target:m");
        router.register_methods("target", HashSet::from(["m".to_string()]));
        router.unregister_methods("target");

        let envelope = router
            .call("caller", "target", "m", json!({}), 0)
            .await
            .unwrap();
        assert_eq!(envelope.status, "unknown_target");
    }

    #[tokio::test]
    async fn dispatcher_start_once_stop_terminal() {
        let checker = Arc::new(PermissionChecker::new());
        let router = Arc::new(CallRouter::new(checker));
        assert!(router.start_dispatcher());
        assert!(!router.start_dispatcher());
        router.stop_dispatcher();
        assert!(!router.start_dispatcher());
    }

    #[tokio::test]
    async fn envelope_keys_are_the_wire_contract() {
        let envelope = CallEnvelope::failure("not_supported", "t", "m", 1, "msg".into());
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["call_depth"], json!(1));
        assert_eq!(value["max_depth"], json!(MAX_CALL_DEPTH));
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["status"], json!("not_supported"));
        assert_eq!(value["target"], json!("t"));
        assert_eq!(value["method"], json!("m"));
    }
}
