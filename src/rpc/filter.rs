//! Client-side call filters.
//!
//! Filters run in order before the request is sent. Each receives the call
//! context and the rest of the chain; calling `chain.do_filter(ctx)` continues,
//! returning early stops the call. The end of the chain is the send itself, so
//! once `chain.do_filter(ctx)` returns the outcome is cached in the context and
//! `ctx.response()` reads it. A filter that stops the chain may settle the call
//! with `ctx.complete(..)`; otherwise the caller gets [`RpcError::Stopped`].

use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;

use crate::rpc::context::RequestContext;
use crate::rpc::error::RpcError;

pub trait RpcFilter: Send + Sync {
    /// Lower runs first; filters without an order run last, in insertion order.
    fn order(&self) -> Option<i32> {
        None
    }

    fn do_filter<'a>(&'a self, ctx: &'a RequestContext, chain: FilterChain<'a>) -> BoxFuture<'a, Result<(), RpcError>>;
}

/// The filters still to run for one call.
#[derive(Clone, Copy)]
pub struct FilterChain<'a> {
    filters: &'a [Arc<dyn RpcFilter>],
    index: usize,
}

impl<'a> FilterChain<'a> {
    pub fn new(filters: &'a [Arc<dyn RpcFilter>]) -> Self {
        Self { filters, index: 0 }
    }

    /// Run the next filter, or send the request once every filter has passed.
    ///
    /// A failed send is not an error of the chain: it becomes the call's
    /// outcome, readable through `ctx.response()`.
    pub fn do_filter(self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<(), RpcError>> {
        match self.filters.get(self.index) {
            Some(filter) => {
                let next = FilterChain {
                    filters: self.filters,
                    index: self.index + 1,
                };
                filter.do_filter(ctx, next)
            }
            None => Box::pin(async move {
                let _ = ctx.response().await;
                Ok(())
            }),
        }
    }

    pub fn remaining(&self) -> usize {
        self.filters.len().saturating_sub(self.index)
    }
}

/// Stable sort by declared order; unordered filters keep their relative position at the end.
pub fn sort_filters(filters: &mut [Arc<dyn RpcFilter>]) {
    filters.sort_by_key(|f| match f.order() {
        Some(order) => (false, order),
        None => (true, 0),
    });
}

/// Logs each call's outcome and duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFilter;

impl RpcFilter for LoggingFilter {
    fn order(&self) -> Option<i32> {
        Some(i32::MIN)
    }

    fn do_filter<'a>(&'a self, ctx: &'a RequestContext, chain: FilterChain<'a>) -> BoxFuture<'a, Result<(), RpcError>> {
        Box::pin(async move {
            let start = Instant::now();
            chain.do_filter(ctx).await?;
            match ctx.response().await {
                Ok(_) => tracing::debug!(
                    method = %ctx.method(),
                    address = ?ctx.address(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "RPC call completed"
                ),
                Err(e) => tracing::warn!(
                    method = %ctx.method(),
                    address = ?ctx.address(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "RPC call failed"
                ),
            }
            Ok(())
        })
    }
}

/// Tags each call with a `trace-id` attachment unless one is already set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceIdFilter;

impl RpcFilter for TraceIdFilter {
    fn order(&self) -> Option<i32> {
        Some(0)
    }

    fn do_filter<'a>(&'a self, ctx: &'a RequestContext, chain: FilterChain<'a>) -> BoxFuture<'a, Result<(), RpcError>> {
        if ctx.attachment("trace-id").is_none() {
            ctx.attach("trace-id", uuid::Uuid::new_v4().to_string());
        }
        chain.do_filter(ctx)
    }
}
