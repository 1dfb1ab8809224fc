//! An intercepting HTTP/1.x forward proxy.
//!
//! Clients connect to a [`ProxyServer`] as they would to any HTTP proxy. The
//! server relays their requests to an actual proxy and answers its
//! `407 Proxy Authentication Required` challenges with Basic credentials from
//! a [`CredentialProvider`], so clients never see the challenge. CONNECT
//! requests become opaque tunnels.
//!
//! Messages are parsed from the raw byte stream into pooled blocks. Headers
//! are rewritten through [`Modification`]s over byte [`Span`]s, and bodies are
//! streamed through without being buffered unless a retry may need them.

mod buffer;
mod communication;
mod connection;
mod downstream;
mod error;
mod message;
mod parse;
mod pool;
mod upstream;
mod util;

#[cfg(test)]
mod tests;

pub use {
    buffer::{BODY_STREAM_THRESHOLD, BodyTier, HEADER_SECTION_MAX_LENGTH, Modification, Span},
    downstream::{
        DEFAULT_BACKLOG, DEFAULT_RETRY_COUNT, Direct, ListenerOpts, MessagePools, ProxyOpts,
        ProxyServer, ProxyTarget, ResolveProxy, StaticProxy,
    },
    error::{ListenerError, MessageError, ProxyError},
    message::{BodyLength, Message, ReadingState, Request, Response, TargetForm},
    parse::Authority,
    pool::{
        Block, BlockPool, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_CACHED_BLOCKS,
        DEFAULT_MAX_CACHED_INSTANCES, InstancePool, Poolable,
    },
    upstream::{
        BasicCredential, CredentialProvider, CredentialRequest, NoCredentials, StaticCredential,
    },
    util::{Direction, Prebuffered},
};
