//! # Client Dispatcher
//!
//! Issues calls and correlates their replies.
//!
//! Every call opens its private reply subscription before publishing the
//! request, so no reply can be missed, and closes it on every exit path.
//!
//! | Call | Policy | Result |
//! |------|--------|--------|
//! | [`RpcClient::request_single`] | unicast | first matching response |
//! | [`RpcClient::request_multi`] | broadcast | [`ResponseStream`] of every response |
//! | [`RpcClient::open_stream`] | unicast, queue or claim | [`RpcStream`] |

use crate::channels;
use crate::claim;
use crate::codec::bus_error;
use crate::config::{PayloadCodec, RequestOptions, RpcConfig, SelectionOptions};
use crate::registry::MethodRegistry;
use crate::stream::{start_session, RpcStream, SessionConfig};
use busrpc_bus::{self as bus, MessageBus, Subscription};
use busrpc_telemetry::{HistogramTimer, CALL_DURATION, REQUESTS_SENT};
use busrpc_types::{
    ids, now_millis, ClaimOffer, ErrorCode, FrameBody, MethodPolicy, Reply, Request,
    RequestKind, RpcError, ServiceDefinition, StreamFrame, Topic,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

struct ClientInner {
    service: ServiceDefinition,
    bus: Arc<dyn MessageBus>,
    config: RpcConfig,
    methods: MethodRegistry,
    /// Parent of every call and stream token.
    shutdown: CancellationToken,
    /// Broadcast collectors, stream pumps and token links.
    tasks: TaskTracker,
    closed: AtomicBool,
}

/// Calls methods of one service.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

/// Per-call settings resolved against the client configuration.
struct CallSettings {
    policy: MethodPolicy,
    timeout: Duration,
    selection: SelectionOptions,
}

impl RpcClient {
    /// Client with the default configuration.
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
        info!(service = %service.name, client_id = %service.id, "RPC client created");
        Self {
            inner: Arc::new(ClientInner {
                service,
                bus,
                config,
                methods: MethodRegistry::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn service(&self) -> &ServiceDefinition {
        &self.inner.service
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.service.id
    }

    /// Record the dispatch policy of `method`. Must match the servers'.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an invalid policy, a service or method name
    /// containing a channel separator, or a conflicting re-registration.
    pub fn register_method(&self, method: &str, policy: MethodPolicy) -> Result<(), RpcError> {
        channels::validate_segment("service", &self.inner.service.name)?;
        self.inner.methods.register(method, policy)
    }

    fn settings(&self, method: &str, options: &RequestOptions) -> Result<CallSettings, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::canceled("client closed"));
        }
        options
            .validate()
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        channels::validate_topic(&options.topic)?;
        Ok(CallSettings {
            policy: self.inner.methods.get(method)?,
            timeout: options.timeout.unwrap_or(self.inner.config.request_timeout),
            selection: options
                .selection
                .clone()
                .unwrap_or_else(|| self.inner.config.selection.clone()),
        })
    }

    fn codec(&self) -> PayloadCodec {
        self.inner.config.payload_codec
    }

    fn bus(&self) -> &dyn MessageBus {
        self.inner.bus.as_ref()
    }

    fn build_request(
        &self,
        method: &str,
        topic: &Topic,
        timeout: Duration,
        kind: RequestKind,
        payload: Vec<u8>,
    ) -> Request {
        let sent_at = now_millis();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        Request {
            request_id: ids::new_request_id(),
            client_id: self.inner.service.id.clone(),
            method: method.to_string(),
            topic: topic.clone(),
            sent_at,
            expiry: sent_at.saturating_add(timeout_ms),
            kind,
            payload,
        }
    }

    /// Token for one call: cancelled by `close`, by the caller's token, or
    /// when the returned guard drops.
    fn call_token(&self, caller: Option<CancellationToken>) -> (CancellationToken, DropGuard) {
        let token = self.inner.shutdown.child_token();
        if let Some(caller) = caller {
            let linked = token.clone();
            self.inner.tasks.spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        let guard = token.clone().drop_guard();
        (token, guard)
    }

    async fn subscribe_offers(
        &self,
        policy: &MethodPolicy,
        method: &str,
        request_id: &str,
    ) -> Result<Option<Subscription<ClaimOffer>>, RpcError> {
        if !policy.require_claim {
            return Ok(None);
        }
        let channel = channels::claim_channel(&self.inner.service.name, method, request_id);
        bus::subscribe::<ClaimOffer>(self.bus(), &channel, self.inner.config.channel_size)
            .await
            .map(Some)
            .map_err(bus_error)
    }

    async fn publish_request(&self, method: &str, request: &Request, kind: &str) -> Result<(), RpcError> {
        let channel = channels::request_channel(&self.inner.service.name, method, &request.topic);
        bus::publish(self.bus(), &channel, request)
            .await
            .map_err(bus_error)?;
        REQUESTS_SENT.with_label_values(&[method, kind]).inc();
        debug!(method, request_id = %request.request_id, kind, "Request published");
        Ok(())
    }

    /// Call a unicast method and wait for its response.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: method unregistered or not unicast
    /// - `Unavailable`: no server claimed a claim-required call
    /// - `DeadlineExceeded`: no response within the timeout
    /// - `Canceled`: caller token fired or client closed
    /// - the handler's own error
    pub async fn request_single<Req, Res>(
        &self,
        method: &str,
        req: &Req,
        options: RequestOptions,
    ) -> Result<Res, RpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let settings = self.settings(method, &options)?;
        if settings.policy.is_broadcast() {
            return Err(RpcError::invalid_argument(format!(
                "{method} is a broadcast method"
            )));
        }
        let _timer = HistogramTimer::new(&CALL_DURATION, &[method]);

        let payload = self.codec().encode(req)?;
        let request = self.build_request(
            method,
            &options.topic,
            settings.timeout,
            RequestKind::Unary,
            payload,
        );
        let (cancel, _guard) = self.call_token(options.cancel);

        let reply_channel =
            channels::reply_channel(&self.inner.service.name, method, &request.request_id);
        let mut replies =
            bus::subscribe::<Reply>(self.bus(), &reply_channel, self.inner.config.channel_size)
                .await
                .map_err(bus_error)?;
        let mut offers = self
            .subscribe_offers(&settings.policy, method, &request.request_id)
            .await?;
        self.publish_request(method, &request, "unary").await?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(RpcError::canceled("request canceled")),
            result = tokio::time::timeout(
                settings.timeout,
                self.await_response(
                    method,
                    &request.request_id,
                    &mut replies,
                    offers.as_mut(),
                    &settings.selection,
                    &cancel,
                ),
            ) => result.unwrap_or_else(|_| {
                Err(RpcError::deadline_exceeded(format!(
                    "{method} request {} timed out after {:?}",
                    request.request_id, settings.timeout
                )))
            }),
        };

        let _ = replies.close();
        if let Some(offers) = offers.as_mut() {
            let _ = offers.close();
        }

        let payload = outcome?;
        self.codec().decode(&payload, ErrorCode::MalformedResponse)
    }

    async fn await_response(
        &self,
        method: &str,
        request_id: &str,
        replies: &mut Subscription<Reply>,
        offers: Option<&mut Subscription<ClaimOffer>>,
        selection: &SelectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RpcError> {
        let winner = match offers {
            Some(offers) => {
                let winner = claim::negotiate(
                    self.bus(),
                    &self.inner.service.name,
                    method,
                    request_id,
                    offers,
                    selection,
                    cancel,
                )
                .await?;
                let _ = offers.close();
                Some(winner)
            }
            None => None,
        };

        loop {
            let reply = replies
                .recv()
                .await
                .ok_or_else(|| RpcError::unavailable("reply subscription closed"))?;
            let Reply::Response(response) = reply else {
                continue;
            };
            if response.request_id != request_id {
                continue;
            }
            if winner
                .as_deref()
                .is_some_and(|winner| winner != response.server_id)
            {
                debug!(method, request_id, server_id = %response.server_id, "Ignoring response from unselected server");
                continue;
            }
            return response.result;
        }
    }

    /// Call a broadcast method. Every responding server contributes one item.
    ///
    /// The stream ends once every server that acknowledged the call has
    /// answered and the responder window has passed, at the timeout, on
    /// cancellation, or when it is dropped.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the method is unregistered or not broadcast; bus
    /// failures subscribing or publishing.
    pub async fn request_multi<Req, Res>(
        &self,
        method: &str,
        req: &Req,
        options: RequestOptions,
    ) -> Result<ResponseStream<Res>, RpcError>
    where
        Req: Serialize,
        Res: DeserializeOwned + Send + 'static,
    {
        let settings = self.settings(method, &options)?;
        if !settings.policy.is_broadcast() {
            return Err(RpcError::invalid_argument(format!(
                "{method} is not a broadcast method"
            )));
        }

        let payload = self.codec().encode(req)?;
        let request = self.build_request(
            method,
            &options.topic,
            settings.timeout,
            RequestKind::Multi,
            payload,
        );
        let (cancel, guard) = self.call_token(options.cancel);

        let reply_channel =
            channels::reply_channel(&self.inner.service.name, method, &request.request_id);
        let replies =
            bus::subscribe::<Reply>(self.bus(), &reply_channel, self.inner.config.channel_size)
                .await
                .map_err(bus_error)?;
        self.publish_request(method, &request, "multi").await?;

        let (items_tx, items) = mpsc::channel(self.inner.config.channel_size);
        let collector = Collector {
            method: method.to_string(),
            request_id: request.request_id.clone(),
            codec: self.codec(),
            deadline: Instant::now() + settings.timeout,
            responder_window: self.inner.config.responder_window,
        };
        self.inner
            .tasks
            .spawn(collector.run(replies, items_tx, cancel.clone()));

        Ok(ResponseStream {
            request_id: request.request_id,
            items,
            cancel,
            _guard: guard,
        })
    }

    /// Open a bidirectional stream on a unicast method.
    ///
    /// The stream is bound to the caller's token, if any, and to the client:
    /// either cancelling closes it with `Canceled`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: method unregistered, broadcast, or neither
    ///   queue nor claim delivered
    /// - `Unavailable`: no server claimed the stream
    /// - `DeadlineExceeded`: no server accepted it within the timeout
    /// - the server's rejection
    pub async fn open_stream<Out, In>(
        &self,
        method: &str,
        options: RequestOptions,
    ) -> Result<RpcStream<Out, In>, RpcError>
    where
        Out: Serialize,
        In: DeserializeOwned,
    {
        let settings = self.settings(method, &options)?;
        let policy = settings.policy;
        if policy.is_broadcast() || !(policy.queue || policy.require_claim) {
            return Err(RpcError::invalid_argument(format!(
                "stream method {method} requires unicast queue or claim delivery"
            )));
        }

        let stream_id = ids::new_stream_id();
        let request = self.build_request(
            method,
            &options.topic,
            settings.timeout,
            RequestKind::StreamOpen {
                stream_id: stream_id.clone(),
            },
            Vec::new(),
        );
        let service = &self.inner.service.name;
        let to_client = channels::stream_client_channel(service, method, &stream_id);
        let to_server = channels::stream_server_channel(service, method, &stream_id);

        let mut frames =
            bus::subscribe::<StreamFrame>(self.bus(), &to_client, self.inner.config.channel_size)
                .await
                .map_err(bus_error)?;
        let mut offers = self
            .subscribe_offers(&policy, method, &request.request_id)
            .await?;
        self.publish_request(method, &request, "stream").await?;

        let opened = {
            let (cancel, _guard) = self.call_token(options.cancel.clone());
            tokio::select! {
                _ = cancel.cancelled() => Err(RpcError::canceled("stream open canceled")),
                result = tokio::time::timeout(
                    settings.timeout,
                    self.await_open(
                        method,
                        &request.request_id,
                        &stream_id,
                        &mut frames,
                        offers.as_mut(),
                        &settings.selection,
                        &cancel,
                    ),
                ) => result.unwrap_or_else(|_| {
                    Err(RpcError::deadline_exceeded(format!(
                        "stream {stream_id} not accepted within {:?}",
                        settings.timeout
                    )))
                }),
            }
        };
        if let Some(offers) = offers.as_mut() {
            let _ = offers.close();
        }

        let server_id = match opened {
            Ok(server_id) => server_id,
            Err(e) => {
                let _ = frames.close();
                // A server may still accept late; tell it to stop.
                let close = StreamFrame {
                    stream_id: stream_id.clone(),
                    frame_id: 0,
                    sent_at: now_millis(),
                    body: FrameBody::Close(Some(e.clone())),
                };
                let _ = bus::publish(self.bus(), &to_server, &close).await;
                return Err(e);
            }
        };
        debug!(method, stream_id = %stream_id, server_id = %server_id, "Stream accepted");

        let parts = start_session(
            SessionConfig {
                stream_id,
                method: method.to_string(),
                peer_id: server_id,
                bus: self.inner.bus.clone(),
                outbound: to_server,
                codec: self.codec(),
                ack_timeout: self.inner.config.stream_ack_timeout,
                parent: self.inner.shutdown.child_token(),
                caller: options.cancel,
            },
            frames,
            0,
            &self.inner.tasks,
        );
        Ok(RpcStream::from_parts(parts, true))
    }

    #[allow(clippy::too_many_arguments)]
    async fn await_open(
        &self,
        method: &str,
        request_id: &str,
        stream_id: &str,
        frames: &mut Subscription<StreamFrame>,
        offers: Option<&mut Subscription<ClaimOffer>>,
        selection: &SelectionOptions,
        cancel: &CancellationToken,
    ) -> Result<String, RpcError> {
        let winner = match offers {
            Some(offers) => Some(
                claim::negotiate(
                    self.bus(),
                    &self.inner.service.name,
                    method,
                    request_id,
                    offers,
                    selection,
                    cancel,
                )
                .await?,
            ),
            None => None,
        };

        loop {
            let frame = frames
                .recv()
                .await
                .ok_or_else(|| RpcError::unavailable("stream subscription closed"))?;
            if frame.stream_id != stream_id {
                continue;
            }
            match frame.body {
                FrameBody::OpenAck { server_id } => {
                    if winner.as_deref().is_some_and(|winner| winner != server_id) {
                        continue;
                    }
                    return Ok(server_id);
                }
                FrameBody::Close(err) => return Err(err.unwrap_or_else(RpcError::stream_closed)),
                FrameBody::Message(_) | FrameBody::Ack => {}
            }
        }
    }

    /// Cancel in-flight calls and close client-opened streams. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(client_id = %self.inner.service.id, "Closing RPC client");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// One broadcast responder's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiResponse<Res> {
    pub server_id: String,
    pub result: Result<Res, RpcError>,
}

/// Responses of a broadcast call, in arrival order.
///
/// Dropping the stream cancels the call.
pub struct ResponseStream<Res> {
    request_id: String,
    items: mpsc::Receiver<MultiResponse<Res>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl<Res> ResponseStream<Res> {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next response, `None` once the call completed or was cancelled.
    pub async fn recv(&mut self) -> Option<MultiResponse<Res>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.items.recv() => item,
        }
    }

    /// Stop the call; no further items are delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<Res> Stream for ResponseStream<Res> {
    type Item = MultiResponse<Res>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.items.poll_recv(cx)
    }
}

impl<Res> std::fmt::Debug for ResponseStream<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("request_id", &self.request_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Feeds a [`ResponseStream`] from the reply subscription of one broadcast.
struct Collector {
    method: String,
    request_id: String,
    codec: PayloadCodec,
    deadline: Instant,
    responder_window: Duration,
}

impl Collector {
    async fn run<Res: DeserializeOwned>(
        self,
        mut replies: Subscription<Reply>,
        items: mpsc::Sender<MultiResponse<Res>>,
        cancel: CancellationToken,
    ) {
        let _timer = HistogramTimer::new(&CALL_DURATION, &[self.method.as_str()]);
        let mut acked: HashSet<String> = HashSet::new();
        let mut answered: HashSet<String> = HashSet::new();
        let mut window_end: Option<Instant> = None;

        let reason = loop {
            let settled = window_end.is_some_and(|end| Instant::now() >= end);
            if settled && answered.len() >= acked.len() {
                break "complete";
            }
            let wake = window_end.filter(|_| !settled).unwrap_or(self.deadline);

            let reply = tokio::select! {
                _ = cancel.cancelled() => break "canceled",
                _ = sleep_until(self.deadline) => break "timeout",
                _ = sleep_until(wake), if !settled && window_end.is_some() => continue,
                reply = replies.recv() => match reply {
                    Some(reply) => reply,
                    None => break "closed",
                },
            };
            if reply.request_id() != self.request_id {
                continue;
            }

            match reply {
                Reply::Ack { server_id, .. } => {
                    if window_end.is_none() {
                        window_end = Some(Instant::now() + self.responder_window);
                    }
                    acked.insert(server_id);
                }
                Reply::Response(response) => {
                    if !answered.insert(response.server_id.clone()) {
                        continue;
                    }
                    acked.insert(response.server_id.clone());
                    if window_end.is_none() {
                        window_end = Some(Instant::now() + self.responder_window);
                    }
                    let result = response
                        .result
                        .and_then(|payload| self.codec.decode(&payload, ErrorCode::MalformedResponse));
                    let item = MultiResponse {
                        server_id: response.server_id,
                        result,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break "canceled",
                        sent = items.send(item) => if sent.is_err() {
                            break "dropped";
                        },
                    }
                }
            }
        };

        let _ = replies.close();
        debug!(
            method = %self.method,
            request_id = %self.request_id,
            responders = acked.len(),
            answered = answered.len(),
            reason,
            "Broadcast call finished"
        );
    }
}
