//! Message bus: engine, delivery channels, and the in-process backend.

pub mod channel;
pub mod delivery;
pub mod engine;
pub mod local;

pub use channel::{
    Channel, ChannelEvent, ChannelFactory, ChannelHandler, ChannelKey, DeliveryMark, HandlerSet,
};
pub use delivery::{CompositeDeliveryObserver, DeliveryObserver, DeliveryRecorder};
pub use engine::{BusBackend, MessageBus};
pub use local::{LocalBusBackend, LocalChannel};
