//! Credit ledger and admin set commands

use crate::NodeState;
use crate::commands::{CommandError, caller, id_param, opt_id_param, require_admin, require_super_admin};
use fleet_lifecycle::FleetError;
use serde_json::{Value, json};
use tracing::info;

/// `amount` as a non-negative integer; `None` when absent or `"all"`.
fn amount_param(params: &Value) -> Result<Option<u64>, CommandError> {
    match params.get("amount") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| format!("'amount' must be a non-negative integer, got {value}").into()),
    }
}

pub async fn handle_credits(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    let caller = caller(params)?;

    if command == "credits.balance" {
        let tenant = opt_id_param(params, "tenant").unwrap_or_else(|| caller.clone());
        if tenant != caller {
            require_admin(state, &caller).await?;
        }
        let balance = state.store.read().await.credits(&tenant);
        return Ok(json!({ "ok": true, "tenant": tenant, "balance": balance }));
    }

    require_admin(state, &caller).await?;
    let tenant = id_param(params, "tenant")?;
    let amount = amount_param(params)?;

    let mut store = state.store.write().await;
    let balance = if command == "credits.add" {
        let amount = amount.ok_or("missing 'amount'")?;
        store.add_credits(&tenant, amount).map_err(FleetError::from)?
    } else {
        store.remove_credits(&tenant, amount).map_err(FleetError::from)?
    };
    info!(by = %caller, tenant = %tenant, command, balance, "credits adjusted");

    Ok(json!({ "ok": true, "tenant": tenant, "balance": balance }))
}

pub async fn handle_admin(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    let caller = caller(params)?;

    if command == "admin.list" {
        require_admin(state, &caller).await?;
        let store = state.store.read().await;
        let admins: Vec<&str> = store.admins().map(String::as_str).collect();
        return Ok(json!({ "ok": true, "super_admin": state.config.super_admin_id, "admins": admins }));
    }

    require_super_admin(state, &caller)?;
    let tenant = id_param(params, "tenant")?;
    let mut store = state.store.write().await;

    let changed = if command == "admin.add" {
        store.add_admin(&tenant).map_err(FleetError::from)?
    } else {
        store.remove_admin(&tenant).map_err(FleetError::from)?
    };
    info!(tenant = %tenant, command, changed, "admin set updated");

    Ok(json!({ "ok": true, "tenant": tenant, "changed": changed }))
}
