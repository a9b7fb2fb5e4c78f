//! Typed entity identifiers.
//!
//! Every identifier wraps a UUID and has a stable textual API form
//! `<prefix>.<uuid>` (for example `topic.5034c67f-f1cb-4fab-aed3-d2cd3b3d50ad`).
//! The textual form is what crosses process boundaries: JSON bootstrap files,
//! HTTP paths, WebSocket frames and log fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when parsing an identifier from its textual form fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// The `<prefix>.` part is missing or names another entity.
    #[error("wrong identifier prefix in '{value}', expected '{expected}'")]
    WrongPrefix {
        value: String,
        expected: &'static str,
    },
    /// The part after the prefix is not a UUID.
    #[error("malformed identifier '{value}': {reason}")]
    Malformed { value: String, reason: String },
}

macro_rules! define_identifier {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            /// Textual prefix of this identifier kind.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdentifierError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

define_identifier!(
    /// Identifies a [`Topic`](crate::Topic).
    TopicId,
    "topic"
);
define_identifier!(
    /// Identifies an [`Ingress`](crate::Ingress).
    IngressId,
    "ingress"
);
define_identifier!(
    /// Identifies an [`Egress`](crate::Egress). Doubles as the subscriber identity.
    EgressId,
    "egress"
);
define_identifier!(
    /// Identifies a [`Label`](crate::Label).
    LabelId,
    "label"
);
define_identifier!(
    /// Identifies a [`LabelHandler`](crate::LabelHandler).
    LabelHandlerId,
    "labelhandler"
);
define_identifier!(
    /// Identifies a [`Message`](crate::Message).
    MessageId,
    "message"
);
define_identifier!(
    /// Identifies a [`Delivery`](crate::Delivery) audit record.
    DeliveryId,
    "delivery"
);

fn parse_prefixed(value: &str, expected: &'static str) -> Result<Uuid, IdentifierError> {
    let Some((prefix, raw)) = value.split_once('.') else {
        return Err(IdentifierError::WrongPrefix {
            value: value.to_string(),
            expected,
        });
    };
    if prefix != expected {
        return Err(IdentifierError::WrongPrefix {
            value: value.to_string(),
            expected,
        });
    }
    Uuid::parse_str(raw).map_err(|e| IdentifierError::Malformed {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
