//! # Server Dispatcher
//!
//! Binds handlers to methods, consumes inbound requests and publishes results.
//!
//! ## Execution Model
//!
//! - One consume loop per `(method, topic)` handler, owning the request
//!   subscription (queue or fanout, per the method policy).
//! - One tracked task per inbound request, so a slow handler never delays
//!   delivery of other requests.
//! - Handler errors are published as data in `Response.result`.
//!
//! ## Shutdown
//!
//! `close(drain)` cancels every consume loop and waits until their
//! subscriptions are closed; with `drain` it then waits for in-flight
//! handlers.

mod handler;

pub use handler::{AffinityFn, HandlerOptions, Next, RpcInfo, ServerInterceptor};

use crate::channels;
use crate::claim;
use crate::codec::bus_error;
use crate::config::RpcConfig;
use crate::registry::MethodRegistry;
use crate::stream::{start_session, RpcStream, SessionConfig, StreamParts};
use busrpc_bus::{self as bus, MessageBus, Subscription};
use busrpc_telemetry::{log_rpc_event, REQUESTS_HANDLED};
use busrpc_types::{
    now_millis, ErrorCode, FrameBody, MethodPolicy, Reply, Request, RequestKind, Response,
    RpcError, ServiceDefinition, StreamFrame, Topic,
};
use dashmap::DashMap;
use futures::FutureExt;
use handler::{ErasedAffinityFn, StreamFn, UnaryFn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

enum HandlerKind {
    Unary {
        call: UnaryFn,
        interceptors: Arc<[Arc<dyn ServerInterceptor>]>,
    },
    Stream {
        call: StreamFn,
    },
}

impl HandlerKind {
    fn is_stream(&self) -> bool {
        matches!(self, HandlerKind::Stream { .. })
    }
}

/// A handler bound to one `(method, topic)`.
struct Registration {
    method: String,
    topic: Topic,
    policy: MethodPolicy,
    kind: HandlerKind,
    affinity: Option<ErasedAffinityFn>,
}

struct ConsumeLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct ServerInner {
    service: ServiceDefinition,
    bus: Arc<dyn MessageBus>,
    config: RpcConfig,
    methods: MethodRegistry,
    handlers: DashMap<(String, Topic), ConsumeLoop>,
    /// Claim-required request ids currently in negotiation on this server.
    claims: DashMap<String, ()>,
    /// Consume loops.
    loops: TaskTracker,
    /// Request handling tasks and stream pumps.
    tasks: TaskTracker,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Serves registered methods of one service instance.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Server with the default configuration.
    pub fn new(service: ServiceDefinition, bus: Arc<dyn MessageBus>) -> Self {
        Self::build(service, bus, RpcConfig::default())
    }

    /// # Errors
    ///
    /// `InvalidArgument` if `config` fails validation.
    pub fn with_config(
        service: ServiceDefinition,
        bus: Arc<dyn MessageBus>,
        config: RpcConfig,
    ) -> Result<Self, RpcError> {
        config
            .validate()
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        Ok(Self::build(service, bus, config))
    }

    fn build(service: ServiceDefinition, bus: Arc<dyn MessageBus>, config: RpcConfig) -> Self {
        info!(service = %service.name, server_id = %service.id, "RPC server created");
        Self {
            inner: Arc::new(ServerInner {
                service,
                bus,
                config,
                methods: MethodRegistry::default(),
                handlers: DashMap::new(),
                claims: DashMap::new(),
                loops: TaskTracker::new(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn service(&self) -> &ServiceDefinition {
        &self.inner.service
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.inner.service.id
    }

    /// Record the dispatch policy of `method`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an invalid policy, a service or method name
    /// containing a channel separator, or a conflicting re-registration.
    pub fn register_method(&self, method: &str, policy: MethodPolicy) -> Result<(), RpcError> {
        channels::validate_segment("service", &self.inner.service.name)?;
        self.inner.methods.register(method, policy)
    }

    /// Bind a unary handler to `method` and start consuming its requests.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the method is unregistered, the affinity option
    /// does not match the policy, or a handler for the same topic exists.
    /// Bus failures subscribing the request channel.
    pub async fn register_handler<Req, Res, F, Fut>(
        &self,
        method: &str,
        handler: F,
        options: HandlerOptions<Req>,
    ) -> Result<(), RpcError>
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(RpcInfo, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, RpcError>> + Send + 'static,
    {
        let codec = self.inner.config.payload_codec;
        let handler = Arc::new(handler);
        let call: UnaryFn = Arc::new(move |info: RpcInfo, payload: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let req: Req = codec.decode(&payload, ErrorCode::MalformedRequest)?;
                let res = handler(info, req).await?;
                codec.encode(&res)
            }
            .boxed()
        });

        let kind = HandlerKind::Unary {
            call,
            interceptors: Arc::from(options.interceptors),
        };
        let affinity = options.affinity.map(|f| self.erase_affinity(f));
        self.install(method, options.topic, kind, affinity).await
    }

    /// Bind a stream handler to `method`.
    ///
    /// The handler receives the server side of each opened stream; when it
    /// returns, the stream is closed with its error unless already closed.
    /// Stream methods must be unicast with queue or claim delivery.
    ///
    /// # Errors
    ///
    /// As [`register_handler`](Self::register_handler).
    pub async fn register_stream_handler<Out, In, F, Fut>(
        &self,
        method: &str,
        handler: F,
        options: HandlerOptions<In>,
    ) -> Result<(), RpcError>
    where
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        F: Fn(RpcInfo, RpcStream<Out, In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let call: StreamFn = Arc::new(move |info: RpcInfo, parts: StreamParts| {
            let handler = handler.clone();
            async move { handler(info, RpcStream::from_parts(parts, false)).await }.boxed()
        });

        let affinity = options.affinity.map(|f| self.erase_affinity(f));
        self.install(method, options.topic, HandlerKind::Stream { call }, affinity)
            .await
    }

    fn erase_affinity<Req>(&self, affinity: AffinityFn<Req>) -> ErasedAffinityFn
    where
        Req: DeserializeOwned + Send + 'static,
    {
        let codec = self.inner.config.payload_codec;
        Arc::new(move |payload: &[u8]| {
            codec
                .decode::<Req>(payload, ErrorCode::MalformedRequest)
                .ok()
                .and_then(|req| affinity(&req))
        })
    }

    async fn install(
        &self,
        method: &str,
        topic: Topic,
        kind: HandlerKind,
        affinity: Option<ErasedAffinityFn>,
    ) -> Result<(), RpcError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::unavailable("server closed"));
        }

        let policy = inner.methods.get(method)?;
        channels::validate_topic(&topic)?;
        if policy.is_broadcast() && affinity.is_some() {
            return Err(RpcError::invalid_argument(format!(
                "broadcast method {method} cannot take an affinity function"
            )));
        }
        if policy.affinity_enabled && affinity.is_none() {
            return Err(RpcError::invalid_argument(format!(
                "method {method} enables affinity but no affinity function was given"
            )));
        }
        if kind.is_stream() && !(policy.queue || policy.require_claim) {
            return Err(RpcError::invalid_argument(format!(
                "stream method {method} requires queue or claim delivery"
            )));
        }

        let key = (method.to_string(), topic.clone());
        if inner.handlers.contains_key(&key) {
            return Err(duplicate_handler(method, &topic));
        }

        let channel = channels::request_channel(&inner.service.name, method, &topic);
        let buffer = inner.config.channel_size;
        let mut requests = if policy.queue {
            bus::subscribe_queue::<Request>(inner.bus.as_ref(), &channel, buffer).await
        } else {
            bus::subscribe::<Request>(inner.bus.as_ref(), &channel, buffer).await
        }
        .map_err(bus_error)?;

        let registration = Arc::new(Registration {
            method: method.to_string(),
            topic: topic.clone(),
            policy,
            kind,
            affinity,
        });

        match inner.handlers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                let _ = requests.close();
                Err(duplicate_handler(method, &topic))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let stop = inner.shutdown.child_token();
                let handle = inner
                    .loops
                    .spawn(inner.clone().consume(requests, registration, stop.clone()));
                slot.insert(ConsumeLoop { stop, handle });
                debug!(method, topic = %topic, queue = policy.queue, "Handler registered");
                Ok(())
            }
        }
    }

    /// Stop serving `method` under `topic`. In-flight requests complete.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such handler is registered.
    pub async fn deregister_handler(&self, method: &str, topic: &Topic) -> Result<(), RpcError> {
        let (_, consume) = self
            .inner
            .handlers
            .remove(&(method.to_string(), topic.clone()))
            .ok_or_else(|| {
                RpcError::new(
                    ErrorCode::NotFound,
                    format!("no handler for {method} on topic '{topic}'"),
                )
            })?;
        consume.stop.cancel();
        if let Err(e) = consume.handle.await {
            warn!(method, error = %e, "Consume loop ended abnormally");
        }
        debug!(method, topic = %topic, "Handler deregistered");
        Ok(())
    }

    /// Stop accepting requests. With `drain`, also wait for in-flight
    /// handlers. Idempotent.
    pub async fn close(&self, drain: bool) {
        let inner = &self.inner;
        if !inner.closed.swap(true, Ordering::AcqRel) {
            info!(server_id = %inner.service.id, drain, "Closing RPC server");
        }
        inner.shutdown.cancel();
        inner.handlers.clear();
        inner.loops.close();
        inner.loops.wait().await;

        inner.tasks.close();
        if drain {
            inner.tasks.wait().await;
        }
    }
}

/// A panicking handler answers `Internal` instead of taking its reply with it.
fn handler_panicked(method: &str, panic: &(dyn Any + Send)) -> RpcError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(method, panic = %detail, "Handler panicked");
    RpcError::internal(format!("handler panicked: {detail}"))
}

fn duplicate_handler(method: &str, topic: &Topic) -> RpcError {
    RpcError::invalid_argument(format!(
        "handler for {method} on topic '{topic}' already registered"
    ))
}

impl ServerInner {
    async fn consume(
        self: Arc<Self>,
        mut requests: Subscription<Request>,
        registration: Arc<Registration>,
        stop: CancellationToken,
    ) {
        loop {
            let request = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let inner = self.clone();
            let registration = registration.clone();
            self.tasks
                .spawn(async move { inner.handle_request(&registration, request).await });
        }

        if let Err(e) = requests.close() {
            warn!(method = %registration.method, error = %e, "Failed to close request subscription");
        }
        debug!(method = %registration.method, topic = %registration.topic, "Consume loop stopped");
    }

    async fn handle_request(&self, reg: &Registration, request: Request) {
        if request.is_expired(now_millis()) {
            debug!(method = %reg.method, request_id = %request.request_id, "Dropping expired request");
            REQUESTS_HANDLED
                .with_label_values(&[reg.method.as_str(), "expired"])
                .inc();
            return;
        }

        if reg.policy.require_claim && !self.win_claim(reg, &request).await {
            return;
        }

        match (&reg.kind, request.kind.clone()) {
            (HandlerKind::Unary { call, interceptors }, RequestKind::Unary | RequestKind::Multi) => {
                self.handle_unary(reg, call, interceptors, request).await;
            }
            (HandlerKind::Stream { call }, RequestKind::StreamOpen { stream_id }) => {
                self.handle_stream(reg, call, request, stream_id).await;
            }
            (HandlerKind::Unary { .. }, RequestKind::StreamOpen { stream_id }) => {
                let err = RpcError::invalid_argument(format!("{} is not a stream method", reg.method));
                self.reject_stream(reg, &stream_id, err).await;
            }
            (HandlerKind::Stream { .. }, RequestKind::Unary | RequestKind::Multi) => {
                let err = RpcError::invalid_argument(format!("{} is a stream method", reg.method));
                self.publish_response(reg, &request, Err(err)).await;
            }
        }
    }

    /// Run the claim negotiation for `request`; true if this server won.
    async fn win_claim(&self, reg: &Registration, request: &Request) -> bool {
        if self.claims.insert(request.request_id.clone(), ()).is_some() {
            let err = RpcError::already_exists(format!(
                "claim for {} already in progress",
                request.request_id
            ));
            warn!(method = %reg.method, request_id = %request.request_id, error = %err, "Dropping duplicate claim request");
            return false;
        }

        let affinity = if reg.policy.affinity_enabled {
            reg.affinity
                .as_ref()
                .and_then(|affinity| affinity(request.payload.as_slice()))
        } else {
            Some(1.0)
        };

        let outcome = claim::offer(
            self.bus.as_ref(),
            &self.service.name,
            &self.service.id,
            request,
            affinity,
            self.config.channel_size,
        )
        .await;
        self.claims.remove(&request.request_id);

        match outcome {
            Ok(selected) => selected,
            Err(e) => {
                warn!(method = %reg.method, request_id = %request.request_id, error = %e, "Claim negotiation failed");
                false
            }
        }
    }

    fn info(&self, reg: &Registration, request: &Request) -> RpcInfo {
        RpcInfo {
            service: self.service.name.clone(),
            method: reg.method.clone(),
            topic: request.topic.clone(),
            request_id: request.request_id.clone(),
            client_id: request.client_id.clone(),
            server_id: self.service.id.clone(),
            multi: request.kind == RequestKind::Multi,
        }
    }

    async fn handle_unary(
        &self,
        reg: &Registration,
        call: &UnaryFn,
        interceptors: &Arc<[Arc<dyn ServerInterceptor>]>,
        request: Request,
    ) {
        let info = self.info(reg, &request);
        let reply_channel =
            channels::reply_channel(&self.service.name, &reg.method, &request.request_id);

        if info.multi {
            let ack = Reply::Ack {
                request_id: request.request_id.clone(),
                server_id: self.service.id.clone(),
            };
            if let Err(e) = bus::publish(self.bus.as_ref(), &reply_channel, &ack).await {
                error!(method = %reg.method, request_id = %request.request_id, error = %e, "Failed to publish responder ack");
            }
        }

        let payload = request.payload.clone();
        let chain = Next::new(interceptors.clone(), call.clone());
        let result = AssertUnwindSafe(chain.run(info, payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(handler_panicked(&reg.method, panic.as_ref())));
        self.publish_response(reg, &request, result).await;
    }

    async fn publish_response(
        &self,
        reg: &Registration,
        request: &Request,
        result: Result<Vec<u8>, RpcError>,
    ) {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code().as_str(),
        };
        REQUESTS_HANDLED
            .with_label_values(&[reg.method.as_str(), outcome])
            .inc();
        log_rpc_event!(debug, reg.method, request.request_id, "Request handled", outcome = outcome);

        let reply = Reply::Response(Response {
            request_id: request.request_id.clone(),
            server_id: self.service.id.clone(),
            sent_at: now_millis(),
            result,
        });
        let channel = channels::reply_channel(&self.service.name, &reg.method, &request.request_id);
        if let Err(e) = bus::publish(self.bus.as_ref(), &channel, &reply).await {
            error!(method = %reg.method, request_id = %request.request_id, error = %e, "Failed to publish response");
        }
    }

    async fn handle_stream(
        &self,
        reg: &Registration,
        call: &StreamFn,
        request: Request,
        stream_id: String,
    ) {
        let to_server = channels::stream_server_channel(&self.service.name, &reg.method, &stream_id);
        let to_client = channels::stream_client_channel(&self.service.name, &reg.method, &stream_id);

        let inbound = match bus::subscribe::<StreamFrame>(
            self.bus.as_ref(),
            &to_server,
            self.config.channel_size,
        )
        .await
        {
            Ok(inbound) => inbound,
            Err(e) => {
                self.reject_stream(reg, &stream_id, bus_error(e)).await;
                return;
            }
        };

        let open_ack = StreamFrame {
            stream_id: stream_id.clone(),
            frame_id: 0,
            sent_at: now_millis(),
            body: FrameBody::OpenAck {
                server_id: self.service.id.clone(),
            },
        };
        if let Err(e) = bus::publish(self.bus.as_ref(), &to_client, &open_ack).await {
            error!(method = %reg.method, stream_id = %stream_id, error = %e, "Failed to acknowledge stream open");
            return;
        }
        debug!(method = %reg.method, stream_id = %stream_id, "Stream opened");

        let parts = start_session(
            SessionConfig {
                stream_id: stream_id.clone(),
                method: reg.method.clone(),
                peer_id: request.client_id.clone(),
                bus: self.bus.clone(),
                outbound: to_client,
                codec: self.config.payload_codec,
                ack_timeout: self.config.stream_ack_timeout,
                parent: self.shutdown.child_token(),
                caller: None,
            },
            inbound,
            1,
            &self.tasks,
        );
        let shared = parts.shared();

        let info = self.info(reg, &request);
        let result = AssertUnwindSafe(call(info, parts))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(handler_panicked(&reg.method, panic.as_ref())));

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.code().as_str(),
        };
        REQUESTS_HANDLED
            .with_label_values(&[reg.method.as_str(), outcome])
            .inc();
        if let Err(e) = shared.close(result.err()).await {
            warn!(method = %reg.method, stream_id = %stream_id, error = %e, "Failed to close stream after handler returned");
        }
    }

    /// Answer a stream open that cannot be served.
    async fn reject_stream(&self, reg: &Registration, stream_id: &str, err: RpcError) {
        let frame = StreamFrame {
            stream_id: stream_id.to_string(),
            frame_id: 0,
            sent_at: now_millis(),
            body: FrameBody::Close(Some(err)),
        };
        let channel = channels::stream_client_channel(&self.service.name, &reg.method, stream_id);
        if let Err(e) = bus::publish(self.bus.as_ref(), &channel, &frame).await {
            error!(method = %reg.method, stream_id, error = %e, "Failed to reject stream open");
        }
    }
}
