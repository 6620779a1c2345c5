use crux_core::capability::{CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::protocol::ClientMessage;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "data")]
pub enum ChannelOperation {
    Connect { endpoint: String, token: String },
    Disconnect,
    Emit { message: ClientMessage },
}

impl ChannelOperation {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::Emit { .. } => "emit",
        }
    }
}

impl Operation for ChannelOperation {
    type Output = ();
}

/// Realtime channel owned by the shell. Every operation is fire-and-forget;
/// the shell reports connection changes and inbound events back as
/// `Event::ChannelConnected`, `Event::ChannelMessage` and friends.
#[derive(crux_core::macros::Capability)]
pub struct Channel<Ev> {
    context: CapabilityContext<ChannelOperation, Ev>,
}

impl<Ev> Channel<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<ChannelOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn connect(&self, endpoint: String, token: String) {
        self.notify(ChannelOperation::Connect { endpoint, token });
    }

    pub fn disconnect(&self) {
        self.notify(ChannelOperation::Disconnect);
    }

    pub fn emit(&self, message: ClientMessage) {
        self.notify(ChannelOperation::Emit { message });
    }

    fn notify(&self, operation: ChannelOperation) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(operation).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestId;
    use serde_json::json;

    #[test]
    fn emit_operation_carries_wire_message() {
        let op = ChannelOperation::Emit {
            message: ClientMessage::ConfirmHelper {
                request_id: RequestId::new("r1"),
            },
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "Emit",
                "data": {"message": {"event": "confirm_helper", "payload": {"requestId": "r1"}}}
            })
        );
    }

    #[test]
    fn operation_names() {
        assert_eq!(ChannelOperation::Disconnect.name(), "disconnect");
        let connect = ChannelOperation::Connect {
            endpoint: "https://example.org".into(),
            token: "t".into(),
        };
        assert_eq!(connect.name(), "connect");
    }
}
