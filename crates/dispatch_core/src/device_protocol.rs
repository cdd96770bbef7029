//! Device protocol handlers (C14): interpret confirmation/resolution
//! messages from the device channel and call the FSMs.
//!
//! Thin translation layer; malformed messages are logged and ignored, never
//! propagated as process failures (spec §4.14).

use bevy_ecs::entity::Entity;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::core::DispatchCore;
use crate::store::Id;

#[derive(Debug, Deserialize)]
struct ConfirmationMessage {
    #[serde(rename = "faultId")]
    fault_id: u64,
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct ResolutionMessage {
    #[serde(rename = "faultId")]
    fault_id: u64,
    resolved: bool,
}

fn parse_fault_id(raw: u64) -> Id {
    Entity::from_bits(raw)
}

/// `{faultId, confirmed:true}` on `vehicle/{number}/confirmation`.
pub async fn handle_confirmation(core: &DispatchCore, payload: &Value) {
    let msg: ConfirmationMessage = match serde_json::from_value(payload.clone()) {
        Ok(m) => m,
        Err(err) => {
            warn!(%err, "malformed confirmation message, ignoring");
            return;
        }
    };
    if !msg.confirmed {
        warn!("confirmation message with confirmed=false, ignoring");
        return;
    }
    let fault_id = parse_fault_id(msg.fault_id);
    if let Err(err) = core.on_confirmation(fault_id).await {
        warn!(?err, ?fault_id, "confirmation handling failed");
    }
}

/// `{faultId, resolved:true}` on `vehicle/{number}/resolved`.
pub async fn handle_resolution(core: &DispatchCore, payload: &Value) {
    let msg: ResolutionMessage = match serde_json::from_value(payload.clone()) {
        Ok(m) => m,
        Err(err) => {
            warn!(%err, "malformed resolution message, ignoring");
            return;
        }
    };
    if !msg.resolved {
        warn!("resolution message with resolved=false, ignoring");
        return;
    }
    let fault_id = parse_fault_id(msg.fault_id);
    if let Err(err) = core.on_resolution(fault_id).await {
        warn!(?err, ?fault_id, "resolution handling failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confirmation_message_parses_expected_shape() {
        let payload = json!({"faultId": 42, "confirmed": true});
        let msg: ConfirmationMessage = serde_json::from_value(payload).unwrap();
        assert_eq!(msg.fault_id, 42);
        assert!(msg.confirmed);
    }

    #[test]
    fn resolution_message_rejects_malformed_shape() {
        let payload = json!({"nope": true});
        let result: Result<ResolutionMessage, _> = serde_json::from_value(payload);
        assert!(result.is_err());
    }
}
