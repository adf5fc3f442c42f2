//! Shared test harness: two fully wired clients joined by an in-memory
//! signaling relay, with fake media and peer-transport backends the
//! tests can inspect and drive.

#![allow(dead_code)]

use async_trait::async_trait;
use carelink_rtc_core::{
    CallConfig, CallSessionManager, CallState, IceCandidate, IncomingCallRouter, LocalTracks,
    MediaBackend, MediaController, MediaError, MediaKind, ParticipantId, PeerError, PeerTransport,
    PeerTransportFactory, SessionDescription, SignalingChannel, SignalingError, SignalingMessage,
    SignalingTransport, TrackHandle, TrackKind, TransportState,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::sleep;

/// One side of an in-memory signaling relay
///
/// Frames sent here arrive on the paired endpoint. Send failures can be
/// injected to simulate an unreachable relay.
pub struct PairedTransport {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
    pub fail_sends: AtomicBool,
}

/// Build both endpoints of an in-memory relay
pub fn signaling_pair() -> (Arc<PairedTransport>, Arc<PairedTransport>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let a = Arc::new(PairedTransport {
        tx: tx_b,
        rx: Mutex::new(rx_a),
        fail_sends: AtomicBool::new(false),
    });
    let b = Arc::new(PairedTransport {
        tx: tx_a,
        rx: Mutex::new(rx_b),
        fail_sends: AtomicBool::new(false),
    });
    (a, b)
}

#[async_trait]
impl SignalingTransport for PairedTransport {
    async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("relay unreachable".to_string()));
        }
        self.tx
            .send(message.clone())
            .map_err(|_| SignalingError::Closed)
    }

    async fn recv(&self) -> Result<SignalingMessage, SignalingError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }
}

/// Capture backend that counts hardware interactions
#[derive(Default)]
pub struct FakeMedia {
    pub deny: AtomicBool,
    pub captures: AtomicU32,
    pub stops: AtomicU32,
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn capture(&self, kind: MediaKind) -> Result<LocalTracks, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(LocalTracks::for_kind(kind))
    }

    async fn stop(&self, _tracks: &LocalTracks) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable peer transport
///
/// Records everything the session manager feeds it; tests drive
/// connectivity through `states` and emit local candidates through
/// `local_candidates`.
pub struct FakePeerTransport {
    pub states: broadcast::Sender<TransportState>,
    pub local_candidates: broadcast::Sender<IceCandidate>,
    pub remote_descriptions: StdMutex<Vec<SessionDescription>>,
    pub remote_candidates: StdMutex<Vec<IceCandidate>>,
    pub closes: AtomicU32,
    pub tracks: StdMutex<Vec<TrackHandle>>,
}

impl FakePeerTransport {
    fn new() -> Self {
        let (states, _) = broadcast::channel(32);
        let (local_candidates, _) = broadcast::channel(32);
        Self {
            states,
            local_candidates,
            remote_descriptions: StdMutex::new(Vec::new()),
            remote_candidates: StdMutex::new(Vec::new()),
            closes: AtomicU32::new(0),
            tracks: StdMutex::new(vec![
                TrackHandle::new(TrackKind::Audio),
                TrackHandle::new(TrackKind::Video),
            ]),
        }
    }

    /// Report a connectivity change to whoever is pumping this transport
    pub fn set_state(&self, state: TransportState) {
        let _ = self.states.send(state);
    }
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 test offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer("v=0 test answer"))
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.remote_descriptions.lock().unwrap().push(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.remote_candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_states(&self) -> broadcast::Receiver<TransportState> {
        self.states.subscribe()
    }

    fn subscribe_local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.local_candidates.subscribe()
    }

    async fn remote_tracks(&self) -> Vec<TrackHandle> {
        self.tracks.lock().unwrap().clone()
    }
}

/// Factory that remembers every transport it handed out
#[derive(Default)]
pub struct FakePeerFactory {
    pub created: StdMutex<Vec<Arc<FakePeerTransport>>>,
}

impl PeerTransportFactory for FakePeerFactory {
    fn create(&self) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let transport = Arc::new(FakePeerTransport::new());
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

impl FakePeerFactory {
    /// The most recently created transport
    pub fn latest(&self) -> Arc<FakePeerTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .expect("no peer transport was created")
            .clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

/// One fully wired client: manager, router (already running), and
/// handles to the fakes behind it
pub struct TestClient {
    pub id: ParticipantId,
    pub manager: Arc<CallSessionManager<PairedTransport>>,
    pub transport: Arc<PairedTransport>,
    pub media: Arc<FakeMedia>,
    pub peers: Arc<FakePeerFactory>,
    pub router: tokio::task::JoinHandle<()>,
}

impl TestClient {
    fn new(id: &str, transport: Arc<PairedTransport>, config: CallConfig) -> Self {
        let id = ParticipantId::new(id);
        let channel = Arc::new(SignalingChannel::new(
            transport.clone(),
            id.clone(),
            config.signaling_retry_attempts,
            config.signaling_retry_delay,
        ));
        let media = Arc::new(FakeMedia::default());
        let peers = Arc::new(FakePeerFactory::default());
        let manager = Arc::new(CallSessionManager::new(
            channel.clone(),
            Arc::new(MediaController::new(media.clone())),
            peers.clone(),
            config,
        ));
        let router = IncomingCallRouter::new(channel, manager.clone()).spawn();
        Self {
            id,
            manager,
            transport,
            media,
            peers,
            router,
        }
    }

    pub fn captures(&self) -> u32 {
        self.media.captures.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.media.stops.load(Ordering::SeqCst)
    }
}

/// A test-friendly configuration with short supervision timers
pub fn fast_config() -> CallConfig {
    CallConfig {
        ring_timeout: Duration::from_millis(150),
        disconnect_grace: Duration::from_millis(150),
        signaling_retry_attempts: 2,
        signaling_retry_delay: Duration::from_millis(5),
        event_capacity: 100,
    }
}

/// Short supervision timers, but a ring timeout that will not fire
/// within a test
pub fn long_ring_config() -> CallConfig {
    CallConfig {
        ring_timeout: Duration::from_secs(30),
        ..fast_config()
    }
}

/// Route test logs through `RUST_LOG` when debugging a failure
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two clients joined by an in-memory relay
pub fn client_pair(config: CallConfig) -> (TestClient, TestClient) {
    client_pair_with(config.clone(), config)
}

/// Two clients with per-side configurations
pub fn client_pair_with(doctor: CallConfig, patient: CallConfig) -> (TestClient, TestClient) {
    init_tracing();
    let (ta, tb) = signaling_pair();
    let doctor = TestClient::new("dr-lopez", ta, doctor);
    let patient = TestClient::new("pt-garcia", tb, patient);
    (doctor, patient)
}

/// Poll until the condition holds or a deadline passes
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll until the manager reports the given state
pub async fn wait_for_state(client: &TestClient, state: CallState) {
    let manager = client.manager.clone();
    wait_until(&format!("state {state:?} on {}", client.id), move || {
        let manager = manager.clone();
        async move { manager.state().await == state }
    })
    .await;
}
