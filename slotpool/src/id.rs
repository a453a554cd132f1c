//! Identifiers for pooled resources and dispatcher slots.
//!
//! UUID v4 avoids confusion with array indices and prevents accidental reuse
//! when a resource is disposed and a new one created in its place.

use serde::{Deserialize, Serialize};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let uuid = uuid::Uuid::parse_str(s)?;
                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identity of one resource created by a [`Pool`](crate::Pool).
    ResourceId
);

uuid_id!(
    /// Identity of one slot created by a [`Dispatcher`](crate::Dispatcher).
    SlotId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(ResourceId::new(), ResourceId::new());
        assert_ne!(SlotId::new(), SlotId::new());
    }

    #[test]
    fn display_and_parse_agree() {
        let id = SlotId::new();
        let parsed = SlotId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(ResourceId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn serializes_transparently() {
        let id = ResourceId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
