//! `EdgeBus` core: typed identifiers, the data model and the HTTP delivery envelope.

pub mod envelope;
pub mod ids;
pub mod types;

pub use envelope::DeliveryEnvelope;
pub use ids::{
    DeliveryId, EgressId, IdentifierError, IngressId, LabelHandlerId, LabelId, MessageId, TopicId,
};
pub use types::{
    Delivery, DeliveryData, DeliveryStatus, Egress, EgressDelivery, EgressKind, Ingress, Label,
    LabelHandler, LabelHandlerKind, Message, MessageData, Topic,
};
