//! HTTP surface of the coordinator

use super::{
    ClaimRequest, ClaimResponse, DeleteResponse, ErrorBody, KeyList, KeysParams, PollParams,
    SubscribeResponse, MAX_POLL_MS,
};
use crate::bus::{BusError, EventBus, InMemoryBus, Subscription};
use crate::events::{Channel, Envelope};
use crate::store::{MemoryStore, StoreError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Subscriptions not polled for this long are dropped
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default long-poll when the client does not ask for one
const DEFAULT_POLL_MS: u64 = 1_000;

struct RemoteSlot {
    subscription: Box<dyn Subscription>,
    last_poll: Instant,
}

/// State shared by the coordinator's handlers
pub struct CoordinatorState {
    bus: Arc<InMemoryBus>,
    store: Arc<MemoryStore>,
    subscriptions: DashMap<String, Arc<Mutex<RemoteSlot>>>,
    next_id: AtomicU64,
    idle_timeout: Duration,
}

impl CoordinatorState {
    pub fn new(bus: Arc<InMemoryBus>, store: Arc<MemoryStore>) -> Self {
        Self {
            bus,
            store,
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<InMemoryBus> {
        &self.bus
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drop idle subscriptions and expired store entries
    fn reap(&self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        self.subscriptions.retain(|id, slot| match slot.try_lock() {
            Ok(slot) => {
                let keep = now.saturating_duration_since(slot.last_poll) < idle_timeout;
                if !keep {
                    debug!(subscription_id = %id, "Dropping idle subscription");
                }
                keep
            }
            // Being polled right now
            Err(_) => true,
        });
        self.store.purge_expired();
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn parse_channel(raw: &str) -> Result<Channel, Response> {
    raw.parse()
        .map_err(|_| error(StatusCode::NOT_FOUND, format!("unknown channel: {}", raw)))
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::InvalidTtl => error(StatusCode::BAD_REQUEST, e.to_string()),
        other => error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

async fn publish(
    State(state): State<Arc<CoordinatorState>>,
    Path(channel): Path<String>,
    Json(envelope): Json<Envelope>,
) -> Response {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(response) => return response,
    };
    if envelope.event_type != channel.as_str() {
        return error(
            StatusCode::BAD_REQUEST,
            format!(
                "envelope type {} does not match channel {}",
                envelope.event_type, channel
            ),
        );
    }

    match state.bus.publish(channel, envelope).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn subscribe(
    State(state): State<Arc<CoordinatorState>>,
    Path(channel): Path<String>,
) -> Response {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(response) => return response,
    };
    state.reap();

    let subscription = match state.bus.subscribe(channel).await {
        Ok(s) => s,
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let id = format!(
        "{}-{}",
        channel,
        state.next_id.fetch_add(1, Ordering::Relaxed)
    );
    state.subscriptions.insert(
        id.clone(),
        Arc::new(Mutex::new(RemoteSlot {
            subscription,
            last_poll: Instant::now(),
        })),
    );
    info!(subscription_id = %id, channel = %channel, "Remote subscription opened");

    Json(SubscribeResponse {
        subscription_id: id,
        channel,
    })
    .into_response()
}

async fn poll(
    State(state): State<Arc<CoordinatorState>>,
    Path(id): Path<String>,
    Query(params): Query<PollParams>,
) -> Response {
    let Some(slot) = state.subscriptions.get(&id).map(|s| Arc::clone(s.value())) else {
        return error(StatusCode::NOT_FOUND, format!("unknown subscription: {}", id));
    };
    let timeout = Duration::from_millis(
        params
            .timeout_ms
            .unwrap_or(DEFAULT_POLL_MS)
            .clamp(1, MAX_POLL_MS),
    );

    let mut slot = slot.lock().await;
    slot.last_poll = Instant::now();
    let received = slot.subscription.recv(timeout).await;
    slot.last_poll = Instant::now();

    match received {
        Ok(Some(envelope)) => Json(envelope).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(BusError::Closed(channel)) => {
            drop(slot);
            state.subscriptions.remove(&id);
            error(StatusCode::GONE, format!("subscription to {} closed", channel))
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn unsubscribe(State(state): State<Arc<CoordinatorState>>, Path(id): Path<String>) -> Response {
    match state.subscriptions.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown subscription: {}", id)),
    }
}

async fn claim(
    State(state): State<Arc<CoordinatorState>>,
    Json(request): Json<ClaimRequest>,
) -> Response {
    let ttl = Duration::from_millis(request.ttl_ms);
    match state.store.try_claim(&request.key, &request.value, ttl) {
        Ok(claimed) => {
            debug!(key = %request.key, claimed, "Claim served");
            Json(ClaimResponse { claimed }).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn list_keys(
    State(state): State<Arc<CoordinatorState>>,
    Query(params): Query<KeysParams>,
) -> Json<KeyList> {
    Json(KeyList {
        keys: state.store.live_keys(&params.prefix),
    })
}

async fn get_key(State(state): State<Arc<CoordinatorState>>, Path(key): Path<String>) -> Response {
    match state.store.entry(&key) {
        Some(entry) => Json(entry).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no such key: {}", key)),
    }
}

async fn delete_key(
    State(state): State<Arc<CoordinatorState>>,
    Path(key): Path<String>,
) -> Json<DeleteResponse> {
    let deleted = state.store.remove(&key);
    if deleted {
        info!(key = %key, "Key deleted on request");
    }
    Json(DeleteResponse { deleted })
}

/// Build the coordinator's router
pub fn router(state: Arc<CoordinatorState>) -> Router {
    Router::new()
        .route("/v1/channels/:channel/events", post(publish))
        .route("/v1/channels/:channel/subscriptions", post(subscribe))
        .route("/v1/subscriptions/:id", get(poll).delete(unsubscribe))
        .route("/v1/store/claim", post(claim))
        .route("/v1/store/keys", get(list_keys))
        .route("/v1/store/keys/:key", get(get_key).delete(delete_key))
        .with_state(state)
}
