//! MCP tool governance
//!
//! Every tool call passes the same gate, in this order:
//!
//! 1. default-deny allowlist keyed by (agent role, server)
//! 2. read-only sessions may not call write tools
//! 3. production hosts need explicit authorization
//! 4. cascade writes: the Nth consecutive write across distinct resources
//! 5. per-server and global rate limits
//! 6. payload ceiling, checked on the returned payload
//!
//! Each call, accepted or rejected, produces exactly one audit entry with its
//! outcome and latency. Rejected calls are never retried.

pub mod rate_limit;
pub mod transport;

use regex::Regex;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, warn};

use crate::audit::{AuditDraft, AuditKind, AuditLog, AuditOutcome};
use crate::config::{compile_patterns, McpSettings};
use crate::error::{GovernanceError, Result};
use crate::events::ToolCall;
use crate::session::DeclaredScope;
use crate::types::{AgentRole, SessionId};

pub use rate_limit::{RateLimitCounter, RateLimiter};
pub use transport::{invoke_with_timeout, ToolResponse, ToolTransport};

/// Who is calling, and under which declared scope
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub session: &'a SessionId,
    pub repository: &'a str,
    pub role: &'a AgentRole,
    pub scope: &'a DeclaredScope,
}

/// Run of consecutive write calls inside one session
#[derive(Debug, Clone, Default)]
pub struct WriteCascade {
    resources: Vec<String>,
}

impl WriteCascade {
    fn distinct_with(&self, resource: &str) -> usize {
        let mut set: BTreeSet<&str> = self.resources.iter().map(String::as_str).collect();
        set.insert(resource);
        set.len()
    }

    fn record(&mut self, is_write: bool, resource: String) {
        if is_write {
            self.resources.push(resource);
        } else {
            self.resources.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A call that passed checks 1-5 and has not been performed yet
#[derive(Debug)]
#[must_use]
pub struct Admission {
    started: Instant,
}

/// Gatekeeper for tool calls
#[derive(Debug, Clone)]
pub struct ToolGovernor {
    settings: McpSettings,
    production_patterns: Vec<Regex>,
    limiter: RateLimiter,
}

impl ToolGovernor {
    pub fn new(settings: &McpSettings) -> Result<Self> {
        Ok(Self {
            settings: settings.clone(),
            production_patterns: compile_patterns(
                "mcp.production_host_patterns",
                &settings.production_host_patterns,
            )?,
            limiter: RateLimiter::new(),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn timeout_ms(&self) -> u64 {
        self.settings.call_timeout_ms
    }

    pub fn is_write(&self, tool: &str) -> bool {
        let tool = tool.to_lowercase();
        self.settings
            .write_tool_markers
            .iter()
            .any(|m| tool.contains(&m.to_lowercase()))
    }

    /// Host a server resolves to; unknown servers resolve to their own name
    pub fn resolve_host<'a>(&'a self, server: &'a str) -> &'a str {
        self.settings
            .servers
            .get(server)
            .map_or(server, |s| s.host.as_str())
    }

    fn reject(rule: &str, detail: String) -> GovernanceError {
        GovernanceError::ToolRejected {
            rule: rule.to_string(),
            detail,
        }
    }

    /// Checks 1-5; on success the call is counted and the cascade updated
    fn admit(&self, ctx: &CallContext<'_>, cascade: &mut WriteCascade, call: &ToolCall) -> Result<()> {
        let allowed = self
            .settings
            .allowlist
            .get(&ctx.role.0)
            .is_some_and(|servers| servers.iter().any(|s| s == &call.server));
        if !allowed {
            return Err(Self::reject(
                "mcp.allowlist",
                format!("role '{}' is not allowed to reach server '{}'", ctx.role, call.server),
            ));
        }

        let is_write = self.is_write(&call.tool);
        if ctx.scope.read_only && is_write {
            return Err(Self::reject(
                "scope.read_only",
                format!("tool '{}' writes but the session is declared read-only", call.tool),
            ));
        }

        let host = self.resolve_host(&call.server);
        if !ctx.scope.production_authorized {
            if let Some(pattern) = self.production_patterns.iter().find(|p| p.is_match(host)) {
                return Err(Self::reject(
                    "mcp.production_host_patterns",
                    format!(
                        "host '{host}' matches production pattern '{}' and the session has no production authorization",
                        pattern.as_str()
                    ),
                ));
            }
        }

        let resource = call.resource();
        let limit = self.settings.cascade_write_limit;
        if is_write && limit > 0 && cascade.distinct_with(&resource) >= limit {
            return Err(Self::reject(
                "mcp.cascade_write_limit",
                format!(
                    "write to '{resource}' would be write {} in a row across {} distinct resources (limit {limit})",
                    cascade.len() + 1,
                    cascade.distinct_with(&resource)
                ),
            ));
        }

        let server_limit = self.settings.servers.get(&call.server).and_then(|s| s.max_calls);
        self.limiter.try_acquire(
            ctx.session,
            &call.server,
            server_limit,
            self.settings.global_max_calls,
        )?;

        cascade.record(is_write, resource);
        Ok(())
    }

    fn check_payload(&self, ctx: &CallContext<'_>, call: &ToolCall, bytes: u64) -> Result<()> {
        if bytes > self.settings.max_payload_bytes && !ctx.scope.large_payload_declared {
            return Err(Self::reject(
                "mcp.max_payload_bytes",
                format!(
                    "{}/{} returned {bytes} bytes, ceiling is {} and no large payload was declared",
                    call.server, call.tool, self.settings.max_payload_bytes
                ),
            ));
        }
        Ok(())
    }

    fn audit_call(
        &self,
        audit: &AuditLog,
        ctx: &CallContext<'_>,
        call: &ToolCall,
        refusal: Option<&GovernanceError>,
        latency_ms: u64,
    ) -> Result<()> {
        let target = format!("{}/{} on {}", call.server, call.tool, call.resource());
        let draft = match refusal {
            None => {
                debug!(session = %ctx.session, call = %target, latency_ms, "Tool call accepted");
                AuditDraft::new(AuditKind::ToolCall, AuditOutcome::Accepted, target)
            }
            Some(e) => {
                warn!(session = %ctx.session, call = %target, error = %e, "Tool call refused");
                let (outcome, rule) = match e {
                    GovernanceError::ToolRejected { rule, .. } => (AuditOutcome::Rejected, rule.clone()),
                    GovernanceError::RateLimitExceeded { scope, .. } => {
                        (AuditOutcome::Rejected, format!("rate_limit.{scope}"))
                    }
                    GovernanceError::ToolTimeout { .. } => {
                        (AuditOutcome::Failed, "mcp.call_timeout_ms".to_string())
                    }
                    _ => (AuditOutcome::Failed, "transport".to_string()),
                };
                AuditDraft::new(AuditKind::ToolCall, outcome, format!("{target}: {e}")).rule(rule)
            }
        };
        audit.record(draft.session(ctx.session, ctx.repository).latency_ms(latency_ms))?;
        Ok(())
    }

    /// Gate a call that already happened elsewhere (session replay).
    /// The payload ceiling uses the recorded `response_bytes`.
    pub fn admit_recorded(
        &self,
        ctx: &CallContext<'_>,
        cascade: &mut WriteCascade,
        call: &ToolCall,
        audit: &AuditLog,
    ) -> Result<()> {
        let started = Instant::now();
        let outcome = self.admit(ctx, cascade, call).and_then(|()| {
            call.response_bytes
                .map_or(Ok(()), |bytes| self.check_payload(ctx, call, bytes))
        });
        let latency_ms = started.elapsed().as_millis() as u64;
        self.audit_call(audit, ctx, call, outcome.as_ref().err(), latency_ms)?;
        outcome
    }

    /// Checks 1-5 for a call about to be performed. The cascade and the rate
    /// limit slot are taken here, so callers hold the session lock only for
    /// this step and not across the transport. A refusal is audited here.
    pub fn reserve(
        &self,
        ctx: &CallContext<'_>,
        cascade: &mut WriteCascade,
        call: &ToolCall,
        audit: &AuditLog,
    ) -> Result<Admission> {
        let started = Instant::now();
        match self.admit(ctx, cascade, call) {
            Ok(()) => Ok(Admission { started }),
            Err(e) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.audit_call(audit, ctx, call, Some(&e), latency_ms)?;
                Err(e)
            }
        }
    }

    /// Invoke an admitted call and check its payload
    pub async fn perform(
        &self,
        ctx: &CallContext<'_>,
        admission: Admission,
        call: &ToolCall,
        transport: &dyn ToolTransport,
        audit: &AuditLog,
    ) -> Result<ToolResponse> {
        let result = invoke_with_timeout(
            transport,
            &call.server,
            &call.tool,
            &call.args,
            self.settings.call_timeout_ms,
        )
        .await
        .and_then(|response| self.check_payload(ctx, call, response.bytes).map(|()| response));

        let latency_ms = admission.started.elapsed().as_millis() as u64;
        self.audit_call(audit, ctx, call, result.as_ref().err(), latency_ms)?;
        result
    }

    /// Gate, perform and check a call through `transport`
    pub async fn execute(
        &self,
        ctx: &CallContext<'_>,
        cascade: &mut WriteCascade,
        call: &ToolCall,
        transport: &dyn ToolTransport,
        audit: &AuditLog,
    ) -> Result<ToolResponse> {
        let admission = self.reserve(ctx, cascade, call, audit)?;
        self.perform(ctx, admission, call, transport, audit).await
    }

    /// Forget a finished session's counters
    pub fn end_session(&self, session: &SessionId) {
        self.limiter.reset(session);
    }
}
