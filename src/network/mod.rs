//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{RemoteShardStore, RpcClient, TcpTransport};
pub use rpc::{Envelope, Message, PongResponse};
pub use server::{MessageHandler, NetworkServer};
