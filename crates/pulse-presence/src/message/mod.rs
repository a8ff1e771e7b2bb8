//! Wire message definitions.

pub mod types;

pub use types::{
    ClientMessage, ClientValue, GetOptions, OnlineClients, PresenceUpdate, SentryMessage,
    ServerMessage, SetValue,
};
