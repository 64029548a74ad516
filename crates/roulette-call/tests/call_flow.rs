use std::time::Duration;

use async_trait::async_trait;
use roulette_call::{
    CallConfig, CallEvents, CallHandle, CallStatus, IceCandidate, IceServer, MediaError,
    MediaEvent, MediaTransport, Role, SessionDescription,
};
use roulette_server::state::AppState;
use tokio::net::TcpListener;

/// Pretends media connects as soon as a remote description is applied.
#[derive(Default)]
struct LoopbackMedia {
    events: Option<CallEvents>,
    label: &'static str,
}

impl LoopbackMedia {
    fn named(label: &'static str) -> Self {
        Self {
            events: None,
            label,
        }
    }

    fn events(&self) -> Result<&CallEvents, MediaError> {
        self.events.as_ref().ok_or(MediaError::NotInitialized)
    }
}

#[async_trait]
impl MediaTransport for LoopbackMedia {
    async fn initialize(
        &mut self,
        _ice_servers: &[IceServer],
        events: CallEvents,
    ) -> Result<(), MediaError> {
        self.events = Some(events);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::offer(format!("offer from {}", self.label)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription::answer(format!("answer from {}", self.label)))
    }

    async fn set_local_description(
        &mut self,
        _description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.events()?.media(MediaEvent::LocalIceCandidate(IceCandidate {
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
            candidate: format!("candidate:{}", self.label),
        }));
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        _description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.events()?.media(MediaEvent::RemoteStreamAdded {
            stream_id: format!("stream-{}", self.label),
        });
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.events = None;
    }
}

async fn start_server() -> (String, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = AppState::standalone();
    let served = state.clone();
    tokio::spawn(async move {
        let _ = roulette_server::serve(listener, served).await;
    });
    (format!("ws://{addr}/ws"), state)
}

async fn join(url: &str, state: &AppState, label: &'static str) -> CallHandle {
    let before = state.roulette.lock().len();
    let call = roulette_call::connect(url, LoopbackMedia::named(label), CallConfig::default())
        .await
        .expect("connect");
    for _ in 0..200 {
        if state.roulette.lock().len() > before {
            return call;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never registered {label}");
}

async fn reach(call: &CallHandle, want: CallStatus) {
    let mut status = call.subscribe();
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        while *status.borrow_and_update() != want {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {want}");
    assert_eq!(call.status(), want);
}

#[test_timeout::tokio_timeout_test(30)]
async fn two_clients_connect_and_hangup_finishes_both() {
    let (url, state) = start_server().await;

    let first = join(&url, &state, "first").await;
    reach(&first, CallStatus::Matching).await;
    let second = join(&url, &state, "second").await;

    reach(&first, CallStatus::Connected).await;
    reach(&second, CallStatus::Connected).await;
    assert_eq!(first.role(), Some(Role::Answerer));
    assert_eq!(second.role(), Some(Role::Offerer));

    let third = join(&url, &state, "third").await;
    reach(&third, CallStatus::Matching).await;
    second.hangup();
    assert_eq!(second.wait_terminal().await, CallStatus::Finished);
    assert_eq!(first.wait_terminal().await, CallStatus::Finished);
    assert_eq!(third.status(), CallStatus::Matching);
    assert_eq!(third.role(), None);

    third.hangup();
    assert_eq!(third.wait_terminal().await, CallStatus::Finished);
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_server_reports_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let outcome = roulette_call::connect(
        &format!("ws://{addr}/"),
        LoopbackMedia::default(),
        CallConfig::default(),
    )
    .await;
    assert!(matches!(outcome, Err(roulette_call::SignalerError::Connect(_))));
}
