//! Handler chains
//!
//! Four ordered chains steer every transaction: connect, request,
//! response, done. Each handler inspects the shared context and returns a
//! verdict; the first non-[`Verdict::Next`] verdict stops the chain and
//! selects the action. An exhausted (or skipped) chain falls through to
//! the default action for its stage.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use http::{Response, StatusCode};
use thiserror::Error;
use tracing::error;

use crate::context::ProxyCtx;
use crate::responses;

/// Synthesized-response parameters carried by [`Verdict::Reject`].
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub content_type: String,
    pub body: String,
}

impl Rejection {
    pub fn new(status: StatusCode, content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn into_response(self) -> Response<Bytes> {
        responses::synthesize(self.status, &self.content_type, self.body)
    }
}

/// What a handler decided.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Continue with the next handler in the chain.
    Next,
    /// Stop the chain; run the default forwarding action.
    Forward,
    /// Request fully satisfied; skip remaining chains (the done chain
    /// still runs).
    Done,
    /// Connect chain only: intercept this CONNECT, complete an inner TLS
    /// handshake with a minted leaf, and loop the decrypted requests back
    /// into the request chain.
    Mitm,
    /// Synthesize an error response and end the transaction.
    Reject(Rejection),
}

/// A pipeline stage. Handlers are synchronous with respect to the
/// pipeline; they may block on their own I/O if they must.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: &mut ProxyCtx) -> Verdict;
}

impl<F> Handler for F
where
    F: Fn(&mut ProxyCtx) -> Verdict + Send + Sync,
{
    fn handle(&self, ctx: &mut ProxyCtx) -> Verdict {
        self(ctx)
    }
}

/// A handler panicked. The owning connection is closed; nothing escapes
/// the transaction.
#[derive(Debug, Error)]
#[error("handler panicked in {chain} chain")]
pub struct ChainPanic {
    pub chain: &'static str,
}

/// An ordered handler chain.
#[derive(Clone)]
pub struct Chain {
    name: &'static str,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Vec::new(),
        }
    }

    pub fn push(&mut self, handler: impl Handler + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Run the chain to its first non-`Next` verdict. Panics are caught
    /// here so a misbehaving handler takes down one context, not the
    /// process.
    pub fn run(&self, ctx: &mut ProxyCtx) -> Result<Verdict, ChainPanic> {
        for handler in &self.handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler.handle(ctx)));
            let verdict = match result {
                Ok(verdict) => verdict,
                Err(_) => {
                    error!(
                        session = ctx.session,
                        chain = self.name,
                        "handler panicked; closing connection"
                    );
                    return Err(ChainPanic { chain: self.name });
                }
            };
            match verdict {
                Verdict::Next => continue,
                other => return Ok(other),
            }
        }
        Ok(Verdict::Next)
    }
}
