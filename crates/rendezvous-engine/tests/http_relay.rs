use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

use rendezvous_engine::model::LocalPresence;
use rendezvous_engine::relay::{HttpRelayClient, PollRequest, PollResponse, RelayClient};
use rendezvous_engine::{PresenceRecord, SessionId, TransportError};

#[derive(Clone, Default)]
struct MockRelay {
    polls: Arc<Mutex<Vec<(String, PollRequest)>>>,
    left: Arc<Mutex<Vec<(String, String)>>>,
}

async fn poll(
    State(state): State<MockRelay>,
    Path(room): Path<String>,
    Json(request): Json<PollRequest>,
) -> Result<Json<PollResponse>, StatusCode> {
    if room == "broken" {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let peer = LocalPresence::new(SessionId::from("peer-1"), "peer".into(), "peer-ctx".into());
    state.polls.lock().push((room, request));
    Ok(Json(PollResponse {
        records: vec![PresenceRecord::new(&peer, 7, Vec::new())],
        cursor: Some(42),
    }))
}

async fn leave(
    State(state): State<MockRelay>,
    Path((room, session)): Path<(String, String)>,
) -> StatusCode {
    state.left.lock().push((room, session));
    StatusCode::NO_CONTENT
}

async fn serve(state: MockRelay) -> (Url, oneshot::Sender<()>) {
    let router = Router::new()
        .route("/p2p/rooms/:room/poll", post(poll))
        .route("/p2p/rooms/:room/sessions/:session", delete(leave))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    let url = Url::parse(&format!("http://{addr}/p2p/")).expect("base url");
    (url, shutdown_tx)
}

fn request(room: &str) -> PollRequest {
    let local = LocalPresence::new(SessionId::from("self-1"), "self".into(), "self-ctx".into());
    PollRequest {
        room_id: room.into(),
        record: PresenceRecord::new(&local, 3, Vec::new()),
        cursor: Some(41),
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn poll_round_trips_json() {
    let state = MockRelay::default();
    let (url, shutdown) = serve(state.clone()).await;
    let client = HttpRelayClient::new(url, Duration::from_secs(5)).expect("client");

    let response = client.poll(request("room-one")).await.expect("poll succeeds");
    assert_eq!(response.cursor, Some(42));
    assert_eq!(response.records.len(), 1);
    assert_eq!(response.records[0].session_id.as_str(), "peer-1");
    assert_eq!(response.records[0].sequence, 7);

    let polls = state.polls.lock().clone();
    assert_eq!(polls.len(), 1);
    assert_eq!(polls[0].0, "room-one");
    assert_eq!(polls[0].1.cursor, Some(41));
    assert_eq!(polls[0].1.record.client_id, "self");

    let _ = shutdown.send(());
}

#[test_timeout::tokio_timeout_test(20)]
async fn leave_hits_session_endpoint() {
    let state = MockRelay::default();
    let (url, shutdown) = serve(state.clone()).await;
    let client = HttpRelayClient::new(url, Duration::from_secs(5)).expect("client");

    client
        .leave("room-one", &SessionId::from("self-1"))
        .await
        .expect("leave succeeds");
    assert_eq!(
        state.left.lock().clone(),
        vec![("room-one".to_string(), "self-1".to_string())]
    );

    let _ = shutdown.send(());
}

#[test_timeout::tokio_timeout_test(20)]
async fn server_errors_surface_as_status() {
    let (url, shutdown) = serve(MockRelay::default()).await;
    let client = HttpRelayClient::new(url, Duration::from_secs(5)).expect("client");

    let err = client.poll(request("broken")).await.expect_err("poll fails");
    assert_eq!(err, TransportError::Status(500));

    let _ = shutdown.send(());
}

#[test_timeout::tokio_timeout_test(20)]
async fn unreachable_relay_is_an_http_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let url = Url::parse(&format!("http://{addr}/")).expect("url");
    let client = HttpRelayClient::new(url, Duration::from_secs(2)).expect("client");

    let err = client.poll(request("room-one")).await.expect_err("poll fails");
    assert!(matches!(err, TransportError::Http(_) | TransportError::Timeout(_)));
}
