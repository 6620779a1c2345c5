use crux_core::capability::{CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::location::{WatchId, WatchOptions};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "data")]
pub enum GeolocationOperation {
    StartWatch {
        watch_id: WatchId,
        options: WatchOptions,
    },
    StopWatch {
        watch_id: WatchId,
    },
}

impl Operation for GeolocationOperation {
    type Output = ();
}

/// Continuous device location. Samples come back as
/// `Event::LocationSampled`, failures as `Event::LocationFailed`.
#[derive(crux_core::macros::Capability)]
pub struct Geolocation<Ev> {
    context: CapabilityContext<GeolocationOperation, Ev>,
}

impl<Ev> Geolocation<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<GeolocationOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start_watch(&self, watch_id: WatchId, options: WatchOptions) {
        self.notify(GeolocationOperation::StartWatch { watch_id, options });
    }

    pub fn stop_watch(&self, watch_id: WatchId) {
        self.notify(GeolocationOperation::StopWatch { watch_id });
    }

    fn notify(&self, operation: GeolocationOperation) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(operation).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_watch_serializes_options() {
        let op = GeolocationOperation::StartWatch {
            watch_id: WatchId(3),
            options: WatchOptions::default(),
        };
        let json = serde_json::to_value(op).unwrap();
        assert_eq!(json["op"], "StartWatch");
        assert_eq!(json["data"]["watch_id"], 3);
        assert_eq!(json["data"]["options"]["high_accuracy"], true);
        assert_eq!(json["data"]["options"]["timeout_ms"], 5_000);
    }
}
