//! Duplex request/response RPC over a bare, line-framed message channel.
//!
//! Either side may issue requests; ids are scoped to the issuing side. Each
//! side serves a static [`MethodSet`] through an [`RpcHandler`] and calls the
//! other side through a typed away stub ([`HostAway`], [`AppAway`]).

pub mod away;
pub mod error;
pub mod handshake;
pub mod methods;
pub mod peer;
pub mod wire;

pub use away::{Away, AppAway, HostAway};
pub use error::RpcError;
pub use handshake::{Hello, HelloReply, POLICY_VIOLATION, PROTOCOL_VERSION};
pub use methods::{AppMethod, HostMethod, MethodSet};
pub use peer::{Caller, RpcHandler, RpcPeer, param};
pub use wire::{RpcMessage, RpcRequest, RpcResponse};
