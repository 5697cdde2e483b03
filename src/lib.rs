//! WarpGrid proxy frontend — CONNECT/transparent destination recovery and
//! opportunistic TLS termination in front of an arbitrary backend.
//!
//! This crate accepts raw client connections, recovers an intended
//! destination (either by parsing the client's own first request, or from a
//! fixed transparent-mode address), and hands back a connection-like value
//! that speaks either the client's original plaintext or a freshly
//! terminated TLS session, with the destination addressable the whole way
//! through.
//!
//! # Components
//!
//! - **`addr`** — the `host/port/tlsbit` address tag carried through a
//!   connection's remote-address slot
//! - **`peek`** — a lookahead buffer used to sniff the first byte of a
//!   connection without consuming it
//! - **`ca`** — certificate authority glue for minting per-hostname leaf
//!   certificates on the fly
//! - **`conn`** — [`ProxyConn`], the per-connection byte stream
//! - **`translator`** — the per-connection state machine that resolves a
//!   destination and produces a [`ProxyConn`]
//! - **`listener`** — [`ProxyListener`], which owns bound sockets and feeds
//!   accepted connections through the translator

pub mod addr;
pub mod ca;
pub mod conn;
pub mod error;
pub mod listener;
pub mod peek;
pub mod translator;

pub use addr::AddressTag;
pub use ca::{CaCertificate, CertifiedLeaf};
pub use conn::ProxyConn;
pub use error::{ProxyError, ProxyResult};
pub use listener::{ListenerState, ProxyListener};
pub use peek::PeekableStream;
pub use translator::{translate, InputConn};
