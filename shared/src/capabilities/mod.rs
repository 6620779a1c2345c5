mod channel;
mod geolocation;
mod timer;

pub use self::channel::{Channel, ChannelOperation};
pub use self::geolocation::{Geolocation, GeolocationOperation};
pub use self::timer::{Cadence, Timer, TimerId, TimerOperation, TimerSlot, TimerSlots};

pub use crux_core::render::Render;
pub use crux_http::Http;
pub use crux_kv::KeyValue;

use crate::app::App;
use crate::event::Event;

#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub channel: Channel<Event>,
    pub geolocation: Geolocation<Event>,
    pub timer: Timer<Event>,
    pub http: Http<Event>,
    pub key_value: KeyValue<Event>,
}
