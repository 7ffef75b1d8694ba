//! Fleet-wide and CPU monitor commands

use crate::NodeState;
use crate::commands::{CommandError, caller, require_admin};
use serde_json::{Value, json};

pub async fn handle_stats(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    require_admin(state, &caller(params)?).await?;
    let stats = state.store.read().await.stats();
    Ok(json!({ "ok": true, "stats": stats }))
}

pub async fn handle_stop_all(state: &NodeState, params: &Value) -> Result<Value, CommandError> {
    let cap = require_admin(state, &caller(params)?).await?;
    let stopped = state.manager.force_stop_all(cap).await?;
    Ok(json!({ "ok": true, "stopped": stopped }))
}

pub async fn handle_monitor(state: &NodeState, command: &str, params: &Value) -> Result<Value, CommandError> {
    require_admin(state, &caller(params)?).await?;
    match command {
        "monitor.enable" => state.monitor.enable(),
        "monitor.disable" => state.monitor.disable(),
        _ => {}
    }
    Ok(json!({ "ok": true, "monitor": state.monitor.status() }))
}
