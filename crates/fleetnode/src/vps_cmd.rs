//! VPS command handlers: delegate to the lifecycle manager

use crate::NodeState;
use crate::access::Need;
use crate::commands::{
    CommandError, caller, capability_for, id_param, int_param, opt_id_param, opt_str_param,
    require_admin, str_param,
};
use fleet_lifecycle::{CreateOutcome, CreateRequest, FleetError};
use fleet_proto::{Capability, VpsRecord};
use serde_json::{Value, json};

/// The container a command targets: `container_id`, or `owner` + `number`.
async fn target(state: &NodeState, params: &Value) -> Result<(String, Option<VpsRecord>), CommandError> {
    let store = state.store.read().await;
    if let Some(id) = opt_str_param(params, "container_id") {
        return Ok((id.to_string(), store.find(id).cloned()));
    }

    let owner = id_param(params, "owner")?;
    let number = int_param(params, "number")?;
    let record = usize::try_from(number)
        .ok()
        .and_then(|n| store.resolve(&owner, n))
        .cloned()
        .ok_or_else(|| FleetError::NotFound(format!("VPS #{number} of tenant '{owner}'")))?;
    Ok((record.container_id.clone(), Some(record)))
}

/// Target plus the caller's capability for it.
async fn authorized(
    state: &NodeState,
    params: &Value,
    need: Need,
) -> Result<(String, Option<VpsRecord>, Capability), CommandError> {
    let caller = caller(params)?;
    let (id, record) = target(state, params).await?;
    let cap = capability_for(state, &caller, record.as_ref(), need).await?;
    Ok((id, record, cap))
}

fn created(outcome: CreateOutcome) -> Value {
    let warnings: Vec<String> = outcome.warnings.iter().map(ToString::to_string).collect();
    json!({
        "ok": true,
        "vps_number": outcome.vps_number,
        "record": outcome.record,
        "warnings": warnings,
    })
}

// ─── Create & Purchase ────────────────────────────────────────────────────────

pub async fn handle_create(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let caller = caller(params)?;
    let cap = require_admin(state, &caller).await?;
    let owner = opt_id_param(params, "owner").unwrap_or(caller);

    let request = CreateRequest::new(owner, int_param(params, "ram")?, int_param(params, "cpu")?)
        .with_static_ip(
            opt_str_param(params, "ipv4").map(String::from),
            opt_str_param(params, "ipv6").map(String::from),
        );
    let outcome = state.manager.create(cap, request).await?;
    Ok(created(outcome))
}

pub async fn handle_purchase(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let buyer = caller(params)?;
    let plan = str_param(params, "plan")?;
    let processor = str_param(params, "processor")?;

    let bought = state
        .manager
        .purchase(
            &buyer,
            plan,
            processor,
            opt_str_param(params, "ipv4").map(String::from),
            opt_str_param(params, "ipv6").map(String::from),
        )
        .await?;

    let mut reply = created(bought.created);
    reply["price"] = json!(bought.price);
    reply["balance"] = json!(bought.balance);
    Ok(reply)
}

// ─── Queries ──────────────────────────────────────────────────────────────────

/// Owned and shared VPS of a tenant (the caller unless an admin asks).
pub async fn handle_list(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let caller = caller(params)?;
    let tenant = opt_id_param(params, "tenant").unwrap_or_else(|| caller.clone());
    if tenant != caller {
        require_admin(state, &caller).await?;
    }

    let store = state.store.read().await;
    let owned: Vec<Value> = store
        .records_of(&tenant)
        .iter()
        .enumerate()
        .map(|(idx, record)| json!({ "number": idx + 1, "record": record }))
        .collect();
    let shared: Vec<Value> = store
        .shared_with(&tenant)
        .into_iter()
        .map(|(location, record)| {
            json!({ "owner_id": location.owner_id, "number": location.number, "record": record })
        })
        .collect();

    Ok(json!({ "ok": true, "tenant": tenant, "owned": owned, "shared": shared }))
}

pub async fn handle_info(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let (id, record, _cap) = authorized(state, params, Need::Any).await?;
    let record = record.ok_or_else(|| FleetError::NotFound(format!("VPS '{id}'")))?;
    let lifecycle = state.manager.state_of(&id).await;
    let number = state.store.read().await.locate(&id).map(|l| l.number);

    Ok(json!({ "ok": true, "number": number, "state": lifecycle, "record": record }))
}

// ─── Power & lifecycle ────────────────────────────────────────────────────────

pub async fn handle_power(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    let need = if command == "vps.reinstall" { Need::Owner } else { Need::Any };
    let (id, _record, cap) = authorized(state, params, need).await?;
    let manager = &state.manager;

    let record = match command {
        "vps.start" => Some(manager.start(cap, &id).await?),
        "vps.stop" => Some(manager.stop(cap, &id).await?),
        "vps.restart" => manager.restart(cap, &id).await?,
        "vps.reinstall" => Some(manager.reinstall(cap, &id).await?),
        "vps.delete" => {
            let removed = manager.delete(cap, &id).await?;
            return Ok(json!({ "ok": true, "deleted": removed.container_id, "owner_id": removed.owner_id }));
        }
        other => return Err(format!("unknown command: {other}").into()),
    };

    Ok(json!({ "ok": true, "container_id": id, "record": record }))
}

pub async fn handle_set_ip(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let (id, _record, cap) = authorized(state, params, Need::Any).await?;
    let record = state
        .manager
        .set_static_ip(cap, &id, opt_str_param(params, "ipv4"), opt_str_param(params, "ipv6"))
        .await?;
    Ok(json!({ "ok": true, "record": record }))
}

pub async fn handle_sharing(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    let (id, _record, cap) = authorized(state, params, Need::Owner).await?;
    let tenant = id_param(params, "tenant")?;

    let record = if command == "vps.share" {
        state.manager.share(cap, &id, &tenant).await?
    } else {
        state.manager.revoke(cap, &id, &tenant).await?
    };
    Ok(json!({ "ok": true, "container_id": id, "shared_with": record.shared_with }))
}

// ─── Snapshots & exec ─────────────────────────────────────────────────────────

pub async fn handle_snapshot(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    let (id, _record, cap) = authorized(state, params, Need::Any).await?;

    match command {
        "vps.snapshot" => {
            let snapshot = state.manager.snapshot(cap, &id).await?;
            Ok(json!({ "ok": true, "container_id": id, "snapshot": snapshot }))
        }
        "vps.snapshots" => {
            let snapshots = state.manager.list_snapshots(cap, &id).await?;
            Ok(json!({ "ok": true, "container_id": id, "snapshots": snapshots }))
        }
        _ => {
            let snapshot = str_param(params, "snapshot")?;
            state.manager.restore(cap, &id, snapshot).await?;
            Ok(json!({ "ok": true, "container_id": id, "restored": snapshot }))
        }
    }
}

pub async fn handle_exec(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let (id, _record, cap) = authorized(state, params, Need::Any).await?;
    let command = str_param(params, "command")?;
    let output = state.manager.exec(cap, &id, command).await?;
    Ok(json!({ "ok": true, "container_id": id, "output": output }))
}

pub async fn handle_ssh(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let (id, _record, cap) = authorized(state, params, Need::Any).await?;
    let ssh = state.manager.ssh_session(cap, &id).await?;
    Ok(json!({ "ok": true, "container_id": id, "session": ssh.session, "ssh": ssh.command }))
}
