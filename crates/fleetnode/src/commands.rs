//! Command dispatch for operator invocations
//!
//! Every command carries a `caller` tenant id in its params; the handler
//! resolves the caller's capability and forwards to the lifecycle manager
//! or the record store.

use crate::NodeState;
use crate::access::{Need, resolve};
use crate::error::{NodeError, NodeResult};
use fleet_lifecycle::FleetError;
use fleet_proto::{Capability, VpsRecord};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// One operator command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    /// Echoed in the reply so callers can match out-of-order answers.
    #[serde(default)]
    pub id: Option<Value>,
    pub command: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    json!({})
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, params: Value) -> Self {
        Self { id: None, command: command.into(), params }
    }

    /// Parse a `{"command": .., "params": {..}}` line.
    pub fn parse(line: &str) -> NodeResult<Self> {
        serde_json::from_str(line).map_err(|e| NodeError::Request(e.to_string()))
    }
}

/// Command error type
pub type CommandError = Box<dyn std::error::Error + Send + Sync>;

/// Handle an operator command.
pub async fn handle_command(state: &NodeState, request: CommandRequest) -> Result<Value, CommandError> {
    debug!(command = %request.command, "handling command");
    let params = &request.params;

    match request.command.as_str() {
        // ── VPS lifecycle ──────────────────────────────────────────────────
        "vps.create" => crate::vps_cmd::handle_create(state, params).await,
        "vps.purchase" => crate::vps_cmd::handle_purchase(state, params).await,
        "vps.list" => crate::vps_cmd::handle_list(state, params).await,
        "vps.info" => crate::vps_cmd::handle_info(state, params).await,
        "vps.start" | "vps.stop" | "vps.restart" | "vps.reinstall" | "vps.delete" => {
            crate::vps_cmd::handle_power(state, &request.command, params).await
        }
        "vps.set_ip" => crate::vps_cmd::handle_set_ip(state, params).await,
        "vps.share" | "vps.revoke" => {
            crate::vps_cmd::handle_sharing(state, &request.command, params).await
        }
        "vps.snapshot" | "vps.snapshots" | "vps.restore" => {
            crate::vps_cmd::handle_snapshot(state, &request.command, params).await
        }
        "vps.exec" => crate::vps_cmd::handle_exec(state, params).await,
        "vps.ssh" => crate::vps_cmd::handle_ssh(state, params).await,

        // ── Accounts ──────────────────────────────────────────────────────
        "credits.balance" | "credits.add" | "credits.remove" => {
            crate::account_cmd::handle_credits(state, &request.command, params).await
        }
        "admin.list" | "admin.add" | "admin.remove" => {
            crate::account_cmd::handle_admin(state, &request.command, params).await
        }

        // ── Fleet & monitor ───────────────────────────────────────────────
        "fleet.stats" => crate::fleet_cmd::handle_stats(state, params).await,
        "fleet.stop_all" => crate::fleet_cmd::handle_stop_all(state, params).await,
        "monitor.status" | "monitor.enable" | "monitor.disable" => {
            crate::fleet_cmd::handle_monitor(state, &request.command, params).await
        }

        "node.commands" => Ok(json!({ "ok": true, "commands": crate::COMMANDS })),

        unknown => Err(format!("unknown command: {unknown}").into()),
    }
}

/// Run a command and fold failures into an `{"ok": false}` reply.
pub async fn respond(state: &NodeState, request: CommandRequest) -> Value {
    let command = request.command.clone();
    let id = request.id.clone();
    let mut reply = match handle_command(state, request).await {
        Ok(result) => result,
        Err(e) => {
            warn!(command = %command, error = %e, "command failed");
            json!({ "ok": false, "error": e.to_string(), "command": command })
        }
    };
    if let (Some(id), Some(fields)) = (id, reply.as_object_mut()) {
        fields.insert("id".to_string(), id);
    }
    reply
}

// ─── Params ───────────────────────────────────────────────────────────────────

/// Tenant ids arrive as strings or bare numbers.
pub fn opt_id_param(params: &Value, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn id_param(params: &Value, key: &str) -> Result<String, CommandError> {
    opt_id_param(params, key).ok_or_else(|| format!("missing '{key}'").into())
}

pub fn opt_str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, CommandError> {
    opt_str_param(params, key).ok_or_else(|| format!("missing '{key}'").into())
}

/// Integers may also be given as numeric strings.
pub fn int_param(params: &Value, key: &str) -> Result<i64, CommandError> {
    let value = params.get(key).ok_or_else(|| format!("missing '{key}'"))?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| format!("'{key}' must be an integer").into())
}

pub fn caller(params: &Value) -> Result<String, CommandError> {
    id_param(params, "caller")
}

// ─── Capability ───────────────────────────────────────────────────────────────

pub async fn capability_for(
    state: &NodeState,
    caller: &str,
    record: Option<&VpsRecord>,
    need: Need,
) -> Result<Capability, CommandError> {
    let store = state.store.read().await;
    resolve(&state.config.super_admin_id, &store, caller, record, need).ok_or_else(|| {
        FleetError::PermissionDenied(format!("tenant '{caller}' has no access")).into()
    })
}

/// Admin or super-admin, regardless of any record.
pub async fn require_admin(state: &NodeState, caller: &str) -> Result<Capability, CommandError> {
    capability_for(state, caller, None, Need::Any).await
}

pub fn require_super_admin(state: &NodeState, caller: &str) -> Result<Capability, CommandError> {
    if !state.config.super_admin_id.is_empty() && caller == state.config.super_admin_id {
        Ok(Capability::SuperAdmin)
    } else {
        Err(FleetError::PermissionDenied("only the super admin can manage admins".into()).into())
    }
}
