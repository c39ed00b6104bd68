//! Command router - top-level dispatch entry point

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::connection::ConnectionMatrix;
use crate::models::{CommandRequest, CommandResult, CommandStatus, PolicyContext};
use crate::policy::PolicyEngine;
use crate::telemetry::TelemetryBus;

/// Router tuning knobs
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Global bound on in-flight device operations across all requests
    pub concurrency: usize,
    /// Bounded wait per device operation, gate admission included; an
    /// operation that outlives it is recorded as FAILED
    pub dispatch_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            dispatch_timeout: Duration::from_secs(120),
        }
    }
}

/// Routes authorized command requests to the connection matrix
pub struct CommandRouter {
    matrix: Arc<ConnectionMatrix>,
    policy: Arc<PolicyEngine>,
    audit: Arc<AuditLog>,
    bus: TelemetryBus,
    /// Admission gate shared by every per-device operation
    gate: Arc<Semaphore>,
    dispatch_timeout: Duration,
}

impl CommandRouter {
    pub fn new(
        matrix: Arc<ConnectionMatrix>,
        policy: Arc<PolicyEngine>,
        audit: Arc<AuditLog>,
        bus: TelemetryBus,
        config: RouterConfig,
    ) -> Self {
        Self {
            matrix,
            policy,
            audit,
            bus,
            gate: Arc::new(Semaphore::new(config.concurrency)),
            dispatch_timeout: config.dispatch_timeout,
        }
    }

    /// Authorize and dispatch one request, returning one result per
    /// targeted device
    ///
    /// Denied requests never touch a connector: every target receives a
    /// synthesized REJECTED result carrying the aggregated deny reasons.
    /// Allowed requests fan out concurrently through the admission gate,
    /// and the call returns only after every per-device dispatch has
    /// finished.
    pub async fn dispatch(
        &self,
        request: &CommandRequest,
        context: &PolicyContext,
        extra: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<CommandResult>> {
        if request.device_ids.is_empty() {
            bail!("command request must target at least one device");
        }

        self.audit.record_command_request(request).await?;

        let decision = self.policy.evaluate(context, extra);
        if !decision.allowed {
            info!(
                request_id = %request.request_id,
                reasons = ?decision.reasons,
                "request denied by policy"
            );
            return self.reject_all(request, &decision.reasons).await;
        }

        let branches = request
            .device_ids
            .iter()
            .map(|device_id| self.dispatch_to_device(request, device_id));
        join_all(branches).await.into_iter().collect()
    }

    async fn dispatch_to_device(
        &self,
        request: &CommandRequest,
        device_id: &str,
    ) -> Result<CommandResult> {
        let attempt = timeout(self.dispatch_timeout, async {
            // The permit is dropped on every exit path, including
            // cancellation by the surrounding timeout.
            let _permit = self.gate.acquire().await?;
            let single = request.with_devices(vec![device_id.to_string()]);
            self.bus.emit(
                "command.dispatched",
                json!({"request_id": &request.request_id, "device_id": device_id}),
            );
            anyhow::Ok(self.matrix.execute(device_id, &single).await)
        })
        .await;

        let result = match attempt {
            Ok(result) => result?,
            Err(_elapsed) => {
                warn!(
                    request_id = %request.request_id,
                    device_id = %device_id,
                    "device dispatch timed out"
                );
                let mut result = CommandResult::accepted(&request.request_id, device_id);
                result.mark_complete(
                    CommandStatus::Failed,
                    "",
                    format!(
                        "dispatch timed out after {}s",
                        self.dispatch_timeout.as_secs()
                    ),
                    None,
                );
                result
            }
        };

        self.audit.record_command_result(&result).await?;
        self.bus.emit(
            "command.completed",
            json!({
                "request_id": &request.request_id,
                "device_id": &result.device_id,
                "status": result.status,
                "exit_code": result.exit_code,
            }),
        );
        Ok(result)
    }

    async fn reject_all(
        &self,
        request: &CommandRequest,
        reasons: &[String],
    ) -> Result<Vec<CommandResult>> {
        let stderr = if reasons.is_empty() {
            "Policy denied".to_string()
        } else {
            reasons.join("; ")
        };

        let mut results = Vec::with_capacity(request.device_ids.len());
        for device_id in &request.device_ids {
            let result = CommandResult::rejected(&request.request_id, device_id, &stderr);
            self.audit.record_command_result(&result).await?;
            self.bus.emit(
                "command.rejected",
                json!({
                    "request_id": &request.request_id,
                    "device_id": device_id,
                    "reasons": reasons,
                }),
            );
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, PolicyRule, RuleEffect};
    use crate::transport::{DeviceConnector, LoopbackConnector};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connector that counts invocations and tracks concurrent in-flight
    /// executions
    struct ProbeConnector {
        invocations: AtomicUsize,
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
        delay: Duration,
    }

    impl ProbeConnector {
        fn new(delay: Duration) -> Self {
            Self {
                invocations: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl DeviceConnector for ProbeConnector {
        async fn execute(&self, request: &CommandRequest) -> CommandResult {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let device_id = request
                .device_ids
                .first()
                .map(String::as_str)
                .unwrap_or("unknown");
            let mut result = CommandResult::accepted(&request.request_id, device_id);
            result.mark_complete(CommandStatus::Success, "probe", "", Some(0));
            result
        }

        fn name(&self) -> &str {
            "probe"
        }
    }

    struct Harness {
        router: CommandRouter,
        matrix: Arc<ConnectionMatrix>,
        policy: Arc<PolicyEngine>,
        audit: Arc<AuditLog>,
        bus: TelemetryBus,
        _dir: tempfile::TempDir,
    }

    async fn build(config: RouterConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let bus = TelemetryBus::new();
        let audit = Arc::new(
            AuditLog::open(dir.path().join("audit.log.jsonl"), bus.clone())
                .await
                .unwrap(),
        );
        audit.bootstrap().await.unwrap();
        let policy = Arc::new(PolicyEngine::new(bus.clone()));
        let matrix = Arc::new(ConnectionMatrix::new(bus.clone(), audit.clone()));
        let router = CommandRouter::new(
            matrix.clone(),
            policy.clone(),
            audit.clone(),
            bus.clone(),
            config,
        );
        Harness {
            router,
            matrix,
            policy,
            audit,
            bus,
            _dir: dir,
        }
    }

    async fn register_loopbacks(harness: &Harness, ids: &[&str]) {
        for id in ids {
            harness
                .matrix
                .register_device(
                    Device::new(*id, format!("loopback:{id}")),
                    Some(Arc::new(LoopbackConnector)),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_device_request_fails_loudly() {
        let harness = build(RouterConfig::default()).await;
        let request = CommandRequest::new("ping", Vec::new());
        let context = PolicyContext::from_request(&request);
        let err = harness
            .router
            .dispatch(&request, &context, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one device"));
        // Nothing was recorded for the malformed request.
        assert_eq!(harness.audit.record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allowed_dispatch_yields_result_and_records() {
        let harness = build(RouterConfig::default()).await;
        register_loopbacks(&harness, &["dev1"]).await;
        let baseline = harness.audit.record_count().await.unwrap();

        let request = CommandRequest::new("ping", vec!["dev1".into()]);
        let context = PolicyContext::from_request(&request);
        let results = harness.router.dispatch(&request, &context, None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CommandStatus::Success);
        assert_eq!(results[0].stdout, "loopback:dev1:ping");
        // One request record plus one result record.
        assert_eq!(harness.audit.record_count().await.unwrap(), baseline + 2);
        assert!(harness.audit.verify().await.unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_yields_one_result_per_device() {
        let harness = build(RouterConfig::default()).await;
        let ids = ["dev1", "dev2", "dev3", "dev4"];
        register_loopbacks(&harness, &ids).await;
        let baseline = harness.audit.record_count().await.unwrap();

        let request = CommandRequest::new("ping", ids.iter().map(|id| id.to_string()).collect());
        let context = PolicyContext::from_request(&request);
        let results = harness.router.dispatch(&request, &context, None).await.unwrap();

        assert_eq!(results.len(), ids.len());
        for result in &results {
            assert_eq!(result.status, CommandStatus::Success);
            assert_eq!(result.request_id, request.request_id);
        }
        let mut seen: Vec<&str> = results.iter().map(|r| r.device_id.as_str()).collect();
        seen.sort_unstable();
        assert_eq!(seen, ids);
        assert_eq!(
            harness.audit.record_count().await.unwrap(),
            baseline + ids.len() + 1
        );
    }

    #[tokio::test]
    async fn test_denied_request_never_touches_connectors() {
        let harness = build(RouterConfig::default()).await;
        let probe = Arc::new(ProbeConnector::new(Duration::ZERO));
        for id in ["dev1", "dev2"] {
            harness
                .matrix
                .register_device(Device::new(id, format!("tcp:{id}")), Some(probe.clone()))
                .await
                .unwrap();
        }
        harness.policy.add_rule(
            PolicyRule::new("block", "requested_by == 'blocked'", RuleEffect::Deny)
                .with_description("Requester is on the block list"),
        );
        let mut rejections = harness.bus.watch("command.rejected");

        let mut request = CommandRequest::new("ping", vec!["dev1".into(), "dev2".into()]);
        request.requested_by = "blocked".into();
        let context = PolicyContext::from_request(&request);
        let results = harness.router.dispatch(&request, &context, None).await.unwrap();

        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.status, CommandStatus::Rejected);
            assert!(result.stderr.contains("Requester is on the block list"));
        }
        assert_eq!(probe.invocations.load(Ordering::SeqCst), 0);

        // One rejection event per device.
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), rejections.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.payload["request_id"], request.request_id.as_str());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_gate_bounds_in_flight_operations() {
        let gate_size = 2;
        let harness = build(RouterConfig {
            concurrency: gate_size,
            ..Default::default()
        })
        .await;
        let probe = Arc::new(ProbeConnector::new(Duration::from_millis(30)));
        let ids: Vec<String> = (0..6).map(|n| format!("dev{n}")).collect();
        for id in &ids {
            harness
                .matrix
                .register_device(Device::new(id, format!("tcp:{id}")), Some(probe.clone()))
                .await
                .unwrap();
        }

        // Two simultaneous requests covering six device operations.
        let first = CommandRequest::new("ping", ids[..3].to_vec());
        let second = CommandRequest::new("ping", ids[3..].to_vec());
        let first_ctx = PolicyContext::from_request(&first);
        let second_ctx = PolicyContext::from_request(&second);
        let (a, b) = tokio::join!(
            harness.router.dispatch(&first, &first_ctx, None),
            harness.router.dispatch(&second, &second_ctx, None),
        );

        assert_eq!(a.unwrap().len(), 3);
        assert_eq!(b.unwrap().len(), 3);
        assert_eq!(probe.invocations.load(Ordering::SeqCst), 6);
        assert!(probe.high_water.load(Ordering::SeqCst) <= gate_size);
    }

    #[tokio::test]
    async fn test_slow_device_is_failed_by_bounded_wait() {
        let harness = build(RouterConfig {
            concurrency: 8,
            dispatch_timeout: Duration::from_millis(50),
        })
        .await;
        let probe = Arc::new(ProbeConnector::new(Duration::from_secs(30)));
        harness
            .matrix
            .register_device(Device::new("dev1", "tcp:dev1"), Some(probe))
            .await
            .unwrap();
        let baseline = harness.audit.record_count().await.unwrap();

        let request = CommandRequest::new("ping", vec!["dev1".into()]);
        let context = PolicyContext::from_request(&request);
        let results = harness.router.dispatch(&request, &context, None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CommandStatus::Failed);
        assert!(results[0].stderr.contains("timed out"));
        // The timed-out operation is still recorded like any other.
        assert_eq!(harness.audit.record_count().await.unwrap(), baseline + 2);
        assert!(harness.audit.verify().await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_emits_lifecycle_events() {
        let harness = build(RouterConfig::default()).await;
        register_loopbacks(&harness, &["dev1"]).await;
        let mut dispatched = harness.bus.watch("command.dispatched");
        let mut completed = harness.bus.watch("command.completed");

        let request = CommandRequest::new("ping", vec!["dev1".into()]);
        let context = PolicyContext::from_request(&request);
        harness.router.dispatch(&request, &context, None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), dispatched.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["device_id"], "dev1");

        let event = tokio::time::timeout(Duration::from_secs(1), completed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["status"], "success");
        assert_eq!(event.payload["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_unregistered_target_yields_rejected_result() {
        let harness = build(RouterConfig::default()).await;
        register_loopbacks(&harness, &["dev1"]).await;

        let request = CommandRequest::new("ping", vec!["dev1".into(), "ghost".into()]);
        let context = PolicyContext::from_request(&request);
        let results = harness.router.dispatch(&request, &context, None).await.unwrap();

        assert_eq!(results.len(), 2);
        let ghost = results.iter().find(|r| r.device_id == "ghost").unwrap();
        assert_eq!(ghost.status, CommandStatus::Rejected);
        assert_eq!(ghost.stderr, "Device not registered");
        let dev1 = results.iter().find(|r| r.device_id == "dev1").unwrap();
        assert_eq!(dev1.status, CommandStatus::Success);
    }
}
