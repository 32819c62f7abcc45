//! pipelined http/1.1 client.
//!
//! a [Client] owns one connection to one origin and writes queued requests
//! back-to-back, reading responses in order. a [Pool] shares an origin
//! across many clients, and an [Agent] routes by origin with lazy pool
//! creation and redirect following via [RedirectAgent].
//!
//! responses stream through the [Handler] trait; [Client::request] offers a
//! buffered future-based shortcut.

#![forbid(unsafe_code)]

mod agent;
mod body;
mod client;
mod conn;
mod driver;
mod handler;
mod origin;
mod pool;
mod proto;
mod queue;
mod redirect;
mod request;
mod response;
mod timeout;

pub mod error;

pub use self::agent::{Agent, AgentOptions, PoolFactory, global_agent, set_global_agent};
pub use self::body::{Body, BodySize, BoxBody, Once};
pub use self::client::{Client, ClientOptions, Event};
pub use self::conn::{Io, IoStream, TlsOptions, Upgraded};
pub use self::handler::{AbortHandle, Handler, ResponseHead, ResumeHandle};
pub use self::origin::{Origin, Scheme};
pub use self::pool::{Pool, PoolOptions, WeakPool};
pub use self::redirect::RedirectAgent;
pub use self::request::RequestOpts;
pub use self::response::{Response, ResponseFuture};
pub use self::timeout::TimeoutConfig;

// re-export the vocabulary crates used across the public api.
pub use bytes;
pub use http;
