//! # Claim Negotiator
//!
//! Picks exactly one server among several capable ones for a claim-required
//! unicast call.
//!
//! ```text
//! client: Idle ── publish request ──▶ ClaimRequested ──┬─▶ Selected
//!                                                      └─▶ TimedOut (Unavailable)
//! server: Offered ──┬─▶ Selected ──▶ Completed
//!                   ├─▶ Declined
//!                   └─▶ TimedOut
//! ```
//!
//! Servers subscribe to the selection channel before offering, so the
//! client's selection can never overtake a subscription. No handler runs
//! before its server was named in a selection.

use crate::channels;
use crate::codec::bus_error;
use crate::config::{SelectionOptions, MAX_TIMEOUT};
use busrpc_bus::{self as bus, MessageBus, Subscription};
use busrpc_telemetry::CLAIMS;
use busrpc_types::{now_millis, ClaimOffer, ClaimSelection, Request, RpcError};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Normalized score of an offer: `None` for declines and NaN, otherwise
/// clamped to `[0, 1]`.
pub(crate) fn score(offer: &ClaimOffer) -> Option<f32> {
    match offer.affinity {
        Some(s) if s.is_nan() => None,
        Some(s) => Some(s.clamp(0.0, 1.0)),
        None => None,
    }
}

/// Highest score at or above `minimum_affinity`; ties go to the smallest
/// server id. Independent of offer order.
pub(crate) fn select_winner(offers: &[ClaimOffer], minimum_affinity: f32) -> Option<&ClaimOffer> {
    offers
        .iter()
        .filter_map(|offer| score(offer).map(|s| (s, offer)))
        .filter(|(s, _)| *s >= minimum_affinity)
        .fold(None, |best: Option<(f32, &ClaimOffer)>, (s, offer)| match best {
            None => Some((s, offer)),
            Some((best_score, best_offer)) => {
                if s > best_score || (s == best_score && offer.server_id < best_offer.server_id) {
                    Some((s, offer))
                } else {
                    Some((best_score, best_offer))
                }
            }
        })
        .map(|(_, offer)| offer)
}

/// Client side: collect offers, pick the winner, announce it.
///
/// The selection is always published, naming nobody when the call is
/// abandoned, so waiting servers can stop early.
pub(crate) async fn negotiate(
    bus: &dyn MessageBus,
    service: &str,
    method: &str,
    request_id: &str,
    offers: &mut Subscription<ClaimOffer>,
    options: &SelectionOptions,
    cancel: &CancellationToken,
) -> Result<String, RpcError> {
    let collected = collect_offers(request_id, offers, options, cancel).await;
    let winner = match &collected {
        Ok(collected) => {
            select_winner(collected, options.minimum_affinity).map(|o| o.server_id.clone())
        }
        Err(_) => None,
    };

    let selection = ClaimSelection {
        request_id: request_id.to_string(),
        server_id: winner.clone(),
    };
    let channel = channels::selection_channel(service, method, request_id);
    bus::publish(bus, &channel, &selection)
        .await
        .map_err(bus_error)?;

    let collected = collected?;
    match winner {
        Some(server_id) => {
            CLAIMS.with_label_values(&["selected"]).inc();
            debug!(
                method,
                request_id,
                server_id = %server_id,
                offers = collected.len(),
                "Claim winner selected"
            );
            Ok(server_id)
        }
        None => {
            CLAIMS.with_label_values(&["unavailable"]).inc();
            debug!(method, request_id, offers = collected.len(), "No acceptable claim offer");
            Err(RpcError::unavailable(format!(
                "no server claimed {method} request {request_id}"
            )))
        }
    }
}

async fn collect_offers(
    request_id: &str,
    offers: &mut Subscription<ClaimOffer>,
    options: &SelectionOptions,
    cancel: &CancellationToken,
) -> Result<Vec<ClaimOffer>, RpcError> {
    let window_end = Instant::now() + options.affinity_timeout;
    let mut deadline = window_end;
    let mut seen = HashSet::new();
    let mut collected = Vec::new();

    loop {
        if options
            .expected_offers
            .is_some_and(|expected| collected.len() >= expected)
        {
            break;
        }

        let offer = tokio::select! {
            _ = cancel.cancelled() => return Err(RpcError::canceled("request canceled")),
            _ = sleep_until(deadline) => break,
            offer = offers.recv() => match offer {
                Some(offer) => offer,
                None => break,
            },
        };

        if offer.request_id != request_id || !seen.insert(offer.server_id.clone()) {
            continue;
        }

        let acceptable = score(&offer).is_some_and(|s| s >= options.minimum_affinity);
        collected.push(offer);

        if acceptable {
            if options.accept_first_available {
                break;
            }
            deadline = deadline.min(Instant::now() + options.short_circuit_timeout);
        }
    }

    Ok(collected)
}

/// Server side: offer `affinity` and wait for the client's decision.
///
/// Returns whether this server was selected. Declines publish their offer
/// and return immediately; otherwise the wait is bounded by the request
/// expiry.
pub(crate) async fn offer(
    bus: &dyn MessageBus,
    service: &str,
    server_id: &str,
    request: &Request,
    affinity: Option<f32>,
    buffer_size: usize,
) -> Result<bool, RpcError> {
    let method = request.method.as_str();
    let request_id = request.request_id.as_str();
    let offer = ClaimOffer {
        request_id: request_id.to_string(),
        server_id: server_id.to_string(),
        affinity,
    };
    let claim_channel = channels::claim_channel(service, method, request_id);

    if affinity.is_none() {
        bus::publish(bus, &claim_channel, &offer)
            .await
            .map_err(bus_error)?;
        CLAIMS.with_label_values(&["declined"]).inc();
        debug!(method, request_id, "Declined claim");
        return Ok(false);
    }

    let selection_channel = channels::selection_channel(service, method, request_id);
    let mut selections =
        bus::subscribe::<ClaimSelection>(bus, &selection_channel, buffer_size)
            .await
            .map_err(bus_error)?;
    bus::publish(bus, &claim_channel, &offer)
        .await
        .map_err(bus_error)?;

    let remaining = u64::try_from(request.expiry.saturating_sub(now_millis())).unwrap_or(0);
    let deadline = Instant::now() + Duration::from_millis(remaining).min(MAX_TIMEOUT);

    let outcome = loop {
        let selection = tokio::select! {
            _ = sleep_until(deadline) => break "timeout",
            selection = selections.recv() => match selection {
                Some(selection) => selection,
                None => break "timeout",
            },
        };
        if selection.request_id != request_id {
            continue;
        }
        match selection.server_id.as_deref() {
            Some(winner) if winner == server_id => break "selected",
            _ => break "lost",
        }
    };

    if let Err(e) = selections.close() {
        warn!(method, request_id, error = %e, "Failed to close selection subscription");
    }

    CLAIMS.with_label_values(&[outcome]).inc();
    debug!(method, request_id, server_id, outcome, "Claim resolved");
    Ok(outcome == "selected")
}
