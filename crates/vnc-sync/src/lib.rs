//! Incremental replication of the config DB into the Gremlin server.
//!
//! The [`sync::Syncer`] consumes object-update notifications, applies them
//! through the server backend while connected, and coalesces them into a
//! [`pending::PendingQueue`] during outages.

pub mod pending;
pub mod rabbit;
pub mod sync;

use serde::Deserialize;
use uuid::Uuid;

/// Operation carried by an object-update notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Oper {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One message from the `vnc_config.object-update` exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notification {
    pub oper: Oper,
    #[serde(rename = "type")]
    pub kind: String,
    pub uuid: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_deserialize_from_bus_json() {
        let n: Notification = serde_json::from_str(
            r#"{"oper": "CREATE", "type": "virtual_machine",
                "uuid": "7cb27a47-1c1e-47e1-97a4-d6f9821cd247"}"#,
        )
        .unwrap();
        assert_eq!(n.oper, Oper::Create);
        assert_eq!(n.kind, "virtual_machine");
    }

    #[test]
    fn unknown_opers_are_tolerated() {
        let n: Notification = serde_json::from_str(
            r#"{"oper": "TRUNCATE", "type": "x",
                "uuid": "7cb27a47-1c1e-47e1-97a4-d6f9821cd247"}"#,
        )
        .unwrap();
        assert_eq!(n.oper, Oper::Unknown);
    }
}
