//! Handler registration types and the type-erased handler representation.
//!
//! Typed handlers are wrapped into closures over encoded payloads at
//! registration time, so the dispatcher never sees request or response types.

use crate::stream::StreamParts;
use async_trait::async_trait;
use busrpc_types::{RpcError, Topic};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Call metadata handed to handlers and interceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcInfo {
    pub service: String,
    pub method: String,
    pub topic: Topic,
    pub request_id: String,
    pub client_id: String,
    /// Id of the server executing the call.
    pub server_id: String,
    /// Whether the call is a broadcast.
    pub multi: bool,
}

/// Scores how well this server suits a request, in `[0, 1]`. `None` declines.
pub type AffinityFn<Req> = Arc<dyn Fn(&Req) -> Option<f32> + Send + Sync>;

pub(crate) type UnaryFn =
    Arc<dyn Fn(RpcInfo, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>> + Send + Sync>;

pub(crate) type StreamFn =
    Arc<dyn Fn(RpcInfo, StreamParts) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

pub(crate) type ErasedAffinityFn = Arc<dyn Fn(&[u8]) -> Option<f32> + Send + Sync>;

/// Middleware around unary handlers.
///
/// Interceptors run outermost first and decide whether to call `next`.
#[async_trait]
pub trait ServerInterceptor: Send + Sync {
    async fn intercept(
        &self,
        info: RpcInfo,
        payload: Vec<u8>,
        next: Next,
    ) -> Result<Vec<u8>, RpcError>;
}

/// The remainder of an interceptor chain.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn ServerInterceptor>]>,
    index: usize,
    handler: UnaryFn,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn ServerInterceptor>]>, handler: UnaryFn) -> Self {
        Self {
            chain,
            index: 0,
            handler,
        }
    }

    /// Invoke the next interceptor, or the handler once the chain is exhausted.
    pub async fn run(self, info: RpcInfo, payload: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                interceptor.intercept(info, payload, next).await
            }
            None => (self.handler)(info, payload).await,
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.chain.len() - self.index))
            .finish()
    }
}

/// Per-handler registration options.
pub struct HandlerOptions<Req> {
    /// Scopes the handler's request channel.
    pub topic: Topic,
    /// Required when the method policy enables affinity; forbidden for
    /// broadcast methods.
    pub affinity: Option<AffinityFn<Req>>,
    /// Applied to unary handlers only.
    pub interceptors: Vec<Arc<dyn ServerInterceptor>>,
}

impl<Req> Default for HandlerOptions<Req> {
    fn default() -> Self {
        Self {
            topic: Topic::none(),
            affinity: None,
            interceptors: Vec::new(),
        }
    }
}

impl<Req> HandlerOptions<Req> {
    #[must_use]
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = topic;
        self
    }

    #[must_use]
    pub fn with_affinity<F>(mut self, affinity: F) -> Self
    where
        F: Fn(&Req) -> Option<f32> + Send + Sync + 'static,
    {
        self.affinity = Some(Arc::new(affinity));
        self
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ServerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }
}
