//! Typed message bodies and their wire ids.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::NetworkError;

/// Prefix for every name-derived id.
pub const NAMESPACE_URL: &str = "https://canopy.network/";

/// UUIDv5 of `NAMESPACE_URL + name` in the URL namespace.
pub fn uuid_from_name(name: &str) -> uuid::Uuid {
    let url = format!("{NAMESPACE_URL}{name}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, url.as_bytes())
}

/// Declares a 16-byte id newtype over `uuid::Uuid`.
///
/// The calling crate needs `serde` and `uuid` as dependencies.
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        pub struct $name(pub ::uuid::Uuid);

        impl $name {
            pub const NIL: Self = Self(::uuid::Uuid::nil());

            /// Fresh random id.
            pub fn random() -> Self {
                Self(::uuid::Uuid::new_v4())
            }

            /// Deterministic id derived from `name`.
            pub fn from_name(name: &str) -> Self {
                Self($crate::uuid_from_name(name))
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            pub fn as_uuid(&self) -> &::uuid::Uuid {
                &self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let s = self.0.to_string();
                write!(f, "{}({})", stringify!($name), &s[..8])
            }
        }
    };
}

define_id!(
    /// Wire id of a message body type.
    MessageTypeId
);

/// A body that can travel over the network.
///
/// `NAME` must be unique among the types a process exchanges; the wire id
/// is derived from it.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn message_type() -> MessageTypeId {
        MessageTypeId::from_name(&format!("msgtype/{}", Self::NAME))
    }
}

/// Encode a body with MessagePack.
pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, NetworkError> {
    Ok(rmp_serde::to_vec(msg)?)
}

/// Decode a MessagePack body.
pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, NetworkError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const NAME: &'static str = "Ping";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    impl Message for Pong {
        const NAME: &'static str = "Pong";
    }

    #[test]
    fn type_ids_are_stable_and_distinct() {
        assert_eq!(Ping::message_type(), Ping::message_type());
        assert_ne!(Ping::message_type(), Pong::message_type());
        assert!(!Ping::message_type().is_nil());
    }

    #[test]
    fn name_ids_are_v5() {
        let id = MessageTypeId::from_name("x");
        assert_eq!(id.as_uuid().get_version_num(), 5);
        assert_eq!(id, MessageTypeId::from_name("x"));
        assert_eq!(MessageTypeId::random().as_uuid().get_version_num(), 4);
    }

    #[test]
    fn encode_decode() {
        let bytes = encode(&Ping { seq: 9 }).unwrap();
        let back: Ping = decode(&bytes).unwrap();
        assert_eq!(back, Ping { seq: 9 });
        assert!(decode::<Ping>(&[0xc1]).is_err());
    }
}
