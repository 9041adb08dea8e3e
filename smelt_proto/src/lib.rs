//! Generated protobuf types for smelt's wire codec (C8): the client command oneof, the
//! `ConfigureSmelt` record, the event stream, and the post-run `Invocation` record.
//!
//! These are pure data definitions -- `smelt_events` and `smelt_server` convert to/from the
//! richer Rust-native enums the rest of the crate works with.

pub mod smelt {
    pub mod invocation {
        include!(concat!(env!("OUT_DIR"), "/smelt.invocation.rs"));
    }

    pub mod event {
        include!(concat!(env!("OUT_DIR"), "/smelt.event.rs"));
    }

    pub mod client {
        include!(concat!(env!("OUT_DIR"), "/smelt.client.rs"));
    }
}

pub use smelt::client::*;
pub use smelt::event::*;
pub use smelt::invocation::*;
