//! Thin CDP adapter: flat-session bookkeeping over the transport plus the
//! handful of page operations the verification routine needs (open a page,
//! navigate, click a selector, capture a screenshot).
//!
//! Targets and sessions are discovered through CDP events; an operation on a
//! page whose session has not attached yet waits briefly instead of failing
//! outright.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::config::CdpConfig;
use crate::errors::{ProbeError, ProbeErrorKind};
use crate::transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};

/// Unique identifier for a page/tab.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PageId(pub Uuid);

impl PageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Viewport center of the element a click lands on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

/// Adapter with pluggable transport.
pub struct CdpAdapter {
    pub cfg: CdpConfig,
    transport: Arc<dyn CdpTransport>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    targets: DashMap<String, PageId>,
    sessions: DashMap<String, PageId>,
    page_sessions: DashMap<PageId, String>,
}

impl CdpAdapter {
    pub fn new(cfg: CdpConfig) -> Self {
        let transport = Arc::new(ChromiumTransport::new(cfg.clone()));
        Self::with_transport(cfg, transport)
    }

    pub fn with_transport(cfg: CdpConfig, transport: Arc<dyn CdpTransport>) -> Self {
        Self {
            cfg,
            transport,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            targets: DashMap::new(),
            sessions: DashMap::new(),
            page_sessions: DashMap::new(),
        }
    }

    /// Bring up the transport and start consuming its events.
    pub async fn start(self: Arc<Self>) -> Result<(), ProbeError> {
        self.transport.start().await?;
        let loop_task = tokio::spawn(Self::event_loop(Arc::clone(&self)));
        self.tasks.lock().await.push(loop_task);
        debug!(target: "cdp-adapter", "event loop started");
        Ok(())
    }

    /// Stop the event loop and wait for background tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.tasks.lock().await;
        while let Some(handle) = handles.pop() {
            let _ = handle.await;
        }
    }

    /// Ask the browser to exit, then tear down the adapter. Close failures
    /// are logged and swallowed: the child process is killed with the
    /// transport either way.
    pub async fn close(&self) {
        if let Err(err) = self
            .send_command("Browser.close", Value::Object(Default::default()))
            .await
        {
            warn!(target: "cdp-adapter", %err, "browser close request failed");
        }
        self.shutdown().await;
    }

    /// Open a new tab and wait until its flat-protocol session is attached.
    pub async fn create_page(&self, url: &str) -> Result<PageId, ProbeError> {
        let response = self
            .send_command("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = response
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProbeError::new(ProbeErrorKind::Internal).with_hint("createTarget missing targetId")
            })?
            .to_string();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = self.targets.get(&target_id) {
                let page = *entry.value();
                if self.page_sessions.contains_key(&page) {
                    return Ok(page);
                }
            }

            if Instant::now() >= deadline {
                return Err(ProbeError::new(ProbeErrorKind::Internal)
                    .with_hint("timed out waiting for target attach"));
            }

            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Navigate and block until the document reports an interactive or
    /// complete readyState.
    pub async fn navigate(
        &self,
        page: PageId,
        url: &str,
        deadline: Duration,
    ) -> Result<(), ProbeError> {
        self.send_page_command(page, "Page.navigate", json!({ "url": url }))
            .await?;
        let deadline_at = Instant::now() + deadline;
        self.wait_for_dom_ready(page, deadline_at).await
    }

    /// Click the first element matching `selector`, polling until it appears
    /// or the deadline passes. The click is synthesized as a mouse press and
    /// release on the element center, so page handlers see a real input
    /// event.
    pub async fn click(
        &self,
        page: PageId,
        selector: &str,
        deadline: Duration,
    ) -> Result<(), ProbeError> {
        self.wait_for_page_ready(page).await?;
        let poll_interval = Duration::from_millis(100);
        let deadline_instant = Instant::now() + deadline;
        let anchor = loop {
            if let Some(anchor) = self.query_anchor(page, selector).await? {
                break anchor;
            }

            if Instant::now() >= deadline_instant {
                return Err(ProbeError::new(ProbeErrorKind::TargetNotFound)
                    .with_hint(format!("click target not found for selector '{selector}'")));
            }

            sleep(poll_interval).await;
        };

        let press_payload = json!({
            "type": "mousePressed",
            "x": anchor.x,
            "y": anchor.y,
            "button": "left",
            "buttons": 1,
            "clickCount": 1,
            "pointerType": "mouse",
        });
        self.send_page_command(page, "Input.dispatchMouseEvent", press_payload)
            .await?;

        let release_payload = json!({
            "type": "mouseReleased",
            "x": anchor.x,
            "y": anchor.y,
            "button": "left",
            "buttons": 1,
            "clickCount": 1,
            "pointerType": "mouse",
        });
        self.send_page_command(page, "Input.dispatchMouseEvent", release_payload)
            .await?;
        Ok(())
    }

    /// Capture the page as PNG bytes.
    pub async fn screenshot(&self, page: PageId) -> Result<Vec<u8>, ProbeError> {
        let response = self
            .send_page_command(page, "Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = response
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProbeError::new(ProbeErrorKind::Screenshot).with_hint("missing screenshot data")
            })?;
        STANDARD
            .decode(data)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Screenshot).with_hint(err.to_string()))
    }

    /// Resolve the viewport center of the first match for `selector`, or
    /// `None` while the element does not exist.
    async fn query_anchor(
        &self,
        page: PageId,
        selector: &str,
    ) -> Result<Option<Anchor>, ProbeError> {
        let selector_literal = serde_json::to_string(selector)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Internal).with_hint(err.to_string()))?;

        let expression = format!(
            "(() => {{\n    const el = document.querySelector({selector});\n    if (!el) {{ return null; }}\n    const rect = el.getBoundingClientRect();\n    return {{\n        x: Number.isFinite(rect.left) ? rect.left + rect.width / 2 : 0,\n        y: Number.isFinite(rect.top) ? rect.top + rect.height / 2 : 0\n    }};\n}})()",
            selector = selector_literal
        );

        let response = self
            .send_page_command(
                page,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                }),
            )
            .await?;

        let value = response
            .get("result")
            .and_then(|res| res.get("value"))
            .ok_or_else(|| {
                ProbeError::new(ProbeErrorKind::Internal)
                    .with_hint("selector query did not return a value")
            })?;

        if value.is_null() {
            return Ok(None);
        }

        let obj = value.as_object().ok_or_else(|| {
            ProbeError::new(ProbeErrorKind::Internal)
                .with_hint("selector query entry was not an object")
        })?;
        let x = obj.get("x").and_then(|v| v.as_f64()).ok_or_else(|| {
            ProbeError::new(ProbeErrorKind::Internal).with_hint("selector query entry missing 'x'")
        })?;
        let y = obj.get("y").and_then(|v| v.as_f64()).ok_or_else(|| {
            ProbeError::new(ProbeErrorKind::Internal).with_hint("selector query entry missing 'y'")
        })?;

        Ok(Some(Anchor { x, y }))
    }

    async fn wait_for_dom_ready(&self, page: PageId, deadline: Instant) -> Result<(), ProbeError> {
        loop {
            if Instant::now() >= deadline {
                return Err(ProbeError::new(ProbeErrorKind::NavTimeout)
                    .with_hint("page never reached an interactive readyState"));
            }

            let response = self
                .send_page_command(
                    page,
                    "Runtime.evaluate",
                    json!({
                        "expression": "document.readyState",
                        "returnByValue": true,
                    }),
                )
                .await?;

            let ready = response
                .get("result")
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .map(|state| matches!(state, "interactive" | "complete"))
                .unwrap_or(false);

            if ready {
                return Ok(());
            }

            sleep(Duration::from_millis(100)).await;
        }
    }

    async fn wait_for_page_ready(&self, page: PageId) -> Result<(), ProbeError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.page_sessions.contains_key(&page) {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        Err(ProbeError::new(ProbeErrorKind::Internal)
            .with_hint(format!("cdp session not ready for page {page:?}")))
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, ProbeError> {
        self.transport
            .send_command(CommandTarget::Browser, method, params)
            .await
    }

    async fn send_page_command(
        &self,
        page: PageId,
        method: &str,
        params: Value,
    ) -> Result<Value, ProbeError> {
        if let Some(session) = self.page_sessions.get(&page) {
            let session = session.value().clone();
            self.transport
                .send_command(CommandTarget::Session(session), method, params)
                .await
        } else {
            Err(ProbeError::new(ProbeErrorKind::Internal)
                .with_hint(format!("missing cdp session for page {page:?}")))
        }
    }

    /// Record a page mapping directly. Normally populated by the event loop;
    /// exposed for tests driving a mock transport.
    pub fn register_page(
        &self,
        page: PageId,
        target_id: Option<String>,
        cdp_session: Option<String>,
    ) {
        if let Some(target_id) = target_id {
            self.targets.insert(target_id, page);
        }
        if let Some(session) = cdp_session {
            self.sessions.insert(session.clone(), page);
            self.page_sessions.insert(page, session);
        }
    }

    async fn event_loop(self: Arc<Self>) {
        debug!(target: "cdp-adapter", "event loop entered");
        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(ev) => self.process_event(ev),
                        None => {
                            if !self.shutdown.is_cancelled() {
                                warn!(target: "cdp-adapter", "transport stream ended");
                            }
                            break;
                        }
                    }
                }
            }
        }
        debug!(target: "cdp-adapter", "event loop exiting");
    }

    fn process_event(&self, event: TransportEvent) {
        let outcome = match event.method.as_str() {
            "Target.targetCreated" => self.on_target_created(event.params),
            "Target.targetDestroyed" => self.on_target_destroyed(event.params),
            "Target.attachedToTarget" => self.on_target_attached(event.params),
            "Target.detachedFromTarget" => self.on_target_detached(event.params),
            _ => {
                debug!(target: "cdp-adapter", method = %event.method, "unhandled cdp event");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            warn!(target: "cdp-adapter", %err, "cdp event handling error");
        }
    }

    fn on_target_created(&self, params: Value) -> Result<(), ProbeError> {
        let payload: TargetCreatedParams = serde_json::from_value(params)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Internal).with_hint(err.to_string()))?;

        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        let page_id = PageId::new();
        self.targets.insert(payload.target_info.target_id, page_id);
        Ok(())
    }

    fn on_target_destroyed(&self, params: Value) -> Result<(), ProbeError> {
        let payload: TargetDestroyedParams = serde_json::from_value(params)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Internal).with_hint(err.to_string()))?;

        if let Some((_, page)) = self.targets.remove(&payload.target_id) {
            self.sessions.retain(|_, v| *v != page);
            self.page_sessions.remove(&page);
        }
        Ok(())
    }

    fn on_target_attached(&self, params: Value) -> Result<(), ProbeError> {
        let payload: AttachedToTargetParams = serde_json::from_value(params)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Internal).with_hint(err.to_string()))?;

        if payload.target_info.target_type != "page" {
            return Ok(());
        }

        if let Some(page_entry) = self.targets.get(&payload.target_info.target_id) {
            let page = *page_entry.value();
            self.sessions.insert(payload.session_id.clone(), page);
            self.page_sessions.insert(page, payload.session_id);
        }

        Ok(())
    }

    fn on_target_detached(&self, params: Value) -> Result<(), ProbeError> {
        let payload: DetachedFromTargetParams = serde_json::from_value(params)
            .map_err(|err| ProbeError::new(ProbeErrorKind::Internal).with_hint(err.to_string()))?;
        if let Some((_, page)) = self.sessions.remove(&payload.session_id) {
            self.page_sessions.remove(&page);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetCreatedParams {
    target_info: TargetInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetDestroyedParams {
    target_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachedToTargetParams {
    session_id: String,
    target_info: TargetInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetachedFromTargetParams {
    session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    fn adapter_with(transport: Arc<MockTransport>) -> Arc<CdpAdapter> {
        Arc::new(CdpAdapter::with_transport(
            CdpConfig::default(),
            transport as Arc<dyn CdpTransport>,
        ))
    }

    #[tokio::test]
    async fn commands_route_through_transport() {
        let (transport, _tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");
        assert!(transport.started());

        let page = PageId::new();
        adapter.register_page(page, None, Some("mock-session".into()));

        transport.set_response(Value::Null).await;
        transport
            .set_response(json!({
                "result": {
                    "value": "complete"
                }
            }))
            .await;

        adapter
            .navigate(
                page,
                "http://localhost:8000/Index.html",
                Duration::from_secs(5),
            )
            .await
            .expect("navigate through transport");

        transport
            .set_response(json!({ "data": STANDARD.encode("img") }))
            .await;
        let bytes = adapter
            .screenshot(page)
            .await
            .expect("screenshot through transport");
        assert_eq!(bytes, b"img");

        let commands = transport.commands().await;
        assert!(commands.iter().any(|(method, _)| method == "Page.navigate"));
        assert!(commands
            .iter()
            .any(|(method, _)| method == "Page.captureScreenshot"));

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn click_dispatches_mouse_events() {
        let (transport, _tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");

        let page = PageId::new();
        adapter.register_page(page, None, Some("mock-session".into()));

        transport
            .set_response(json!({
                "result": {
                    "value": { "x": 42.0, "y": 24.0 }
                }
            }))
            .await;

        adapter
            .click(page, "#login-btn", Duration::from_secs(2))
            .await
            .expect("click dispatch succeeds");

        let commands = transport.commands().await;
        let mouse_events: Vec<&Value> = commands
            .iter()
            .filter(|(method, _)| method == "Input.dispatchMouseEvent")
            .map(|(_, params)| params)
            .collect();
        assert_eq!(mouse_events.len(), 2);

        let pressed = mouse_events
            .iter()
            .find(|params| params.get("type").and_then(|v| v.as_str()) == Some("mousePressed"))
            .expect("mousePressed event present");
        assert_eq!(pressed.get("x").and_then(|v| v.as_f64()), Some(42.0));
        assert_eq!(pressed.get("y").and_then(|v| v.as_f64()), Some(24.0));

        assert!(mouse_events
            .iter()
            .any(|params| params.get("type").and_then(|v| v.as_str()) == Some("mouseReleased")));

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn click_reports_missing_target() {
        let (transport, _tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");

        let page = PageId::new();
        adapter.register_page(page, None, Some("mock-session".into()));

        for _ in 0..8 {
            transport
                .set_response(json!({
                    "result": {
                        "value": null
                    }
                }))
                .await;
        }

        let err = adapter
            .click(page, "#missing", Duration::from_millis(250))
            .await
            .expect_err("selector never resolves");
        assert_eq!(err.kind(), &ProbeErrorKind::TargetNotFound);

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn create_page_resolves_after_attach_events() {
        let (transport, tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");

        transport.set_response(json!({ "targetId": "t-1" })).await;

        tx.send(TransportEvent {
            method: "Target.targetCreated".into(),
            params: json!({
                "targetInfo": { "targetId": "t-1", "type": "page" }
            }),
            session_id: None,
        })
        .await
        .unwrap();
        tx.send(TransportEvent {
            method: "Target.attachedToTarget".into(),
            params: json!({
                "sessionId": "s-1",
                "targetInfo": { "targetId": "t-1", "type": "page" }
            }),
            session_id: None,
        })
        .await
        .unwrap();

        let page = adapter
            .create_page("about:blank")
            .await
            .expect("page attaches");

        transport
            .set_response(json!({ "data": STANDARD.encode("evidence") }))
            .await;
        let bytes = adapter.screenshot(page).await.expect("session is wired up");
        assert_eq!(bytes, b"evidence");

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn non_page_targets_are_ignored() {
        let (transport, tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");

        transport.set_response(json!({ "targetId": "sw-1" })).await;

        tx.send(TransportEvent {
            method: "Target.targetCreated".into(),
            params: json!({
                "targetInfo": { "targetId": "sw-1", "type": "service_worker" }
            }),
            session_id: None,
        })
        .await
        .unwrap();

        let err = adapter
            .create_page("about:blank")
            .await
            .expect_err("service workers never become pages");
        assert_eq!(err.kind(), &ProbeErrorKind::Internal);

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn screenshot_rejects_malformed_payload() {
        let (transport, _tx) = MockTransport::new_pair();
        let adapter = adapter_with(transport.clone());

        Arc::clone(&adapter).start().await.expect("start adapter");

        let page = PageId::new();
        adapter.register_page(page, None, Some("mock-session".into()));

        transport
            .set_response(json!({ "data": "!!not-base64!!" }))
            .await;
        let err = adapter
            .screenshot(page)
            .await
            .expect_err("payload is not base64");
        assert_eq!(err.kind(), &ProbeErrorKind::Screenshot);

        transport.set_response(json!({})).await;
        let err = adapter
            .screenshot(page)
            .await
            .expect_err("payload is missing entirely");
        assert_eq!(err.kind(), &ProbeErrorKind::Screenshot);

        adapter.shutdown().await;
    }
}
