//! The peer transport contract.
//!
//! The engine negotiates WebRTC-style connections but never instantiates
//! them itself; an injected [`PeerConnector`] produces [`PeerConnection`]s
//! that follow the standard shape: ICE config in, offer/answer SDP exchange,
//! non-trickle gathering (an awaitable "gathering complete"), and a named
//! ordered [`DataChannel`] with open/message/close callbacks.
//!
//! [`MemoryRtc`] is an in-process implementation of the whole contract.
//! Its "SDP" is just the endpoint id; a pair connects once each side has
//! set the other's description, exactly mirroring the real handshake order.
//! Tests use it to drive full multi-peer meshes without sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;

/// ICE servers handed to the transport at connection creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged through signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// Observable connection states, matching the WebRTC connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States after which the connection is unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub type StateChangeFn = Arc<dyn Fn(PeerConnectionState) + Send + Sync>;
pub type DataChannelFn = Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type OpenFn = Arc<dyn Fn() + Send + Sync>;
pub type MessageFn = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_connection(
        &self,
        ice: &IceConfig,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// One WebRTC-style connection to a remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an ordered data channel with the given label. Initiator side
    /// calls this before the offer so the channel rides the negotiation.
    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Resolve once ICE gathering reaches the `complete` state, after which
    /// `local_description` carries every candidate (non-trickle mode).
    async fn wait_ice_gathering_complete(&self) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> PeerConnectionState;

    fn set_on_connection_state_change(&self, cb: StateChangeFn);
    /// Responder side: invoked with the remote's channel once negotiated.
    fn set_on_data_channel(&self, cb: DataChannelFn);

    async fn close(&self);
}

/// An ordered, reliable data channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> ChannelState;
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;
    fn set_on_open(&self, cb: OpenFn);
    fn set_on_message(&self, cb: MessageFn);
    fn set_on_close(&self, cb: CloseFn);
    fn close(&self);
}

// ───────────────────────────────────────────────────────────────────
// In-memory transport
// ───────────────────────────────────────────────────────────────────

/// Shared in-process RTC fabric. Every participant gets a connector from the
/// same hub; connections pair up through the usual offer/answer dance.
#[derive(Clone, Default)]
pub struct MemoryRtc {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<String, Arc<ConnInner>>>,
}

impl MemoryRtc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector bound to this fabric, one per participant.
    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        Arc::new(MemoryConnector {
            hub: self.hub.clone(),
        })
    }

    /// Test fault injection: every established link transitions to `Failed`
    /// and its channels close, as if the network dropped underneath them.
    pub fn fail_all_links(&self) {
        let conns: Vec<Arc<ConnInner>> = {
            let endpoints = self.hub.endpoints.lock().expect("endpoints");
            endpoints.values().cloned().collect()
        };
        for conn in conns {
            if conn.state() == PeerConnectionState::Connected {
                conn.transition(PeerConnectionState::Failed);
                conn.close_channels();
            }
        }
    }

    /// Number of registered endpoints. Test observability.
    pub fn endpoint_count(&self) -> usize {
        self.hub.endpoints.lock().expect("endpoints").len()
    }
}

struct MemoryConnector {
    hub: Arc<Hub>,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_connection(
        &self,
        _ice: &IceConfig,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let inner = Arc::new(ConnInner {
            id: Uuid::new_v4().to_string(),
            hub: Arc::downgrade(&self.hub),
            state: Mutex::new(PeerConnectionState::New),
            signaling: Mutex::new(SignalingState::Stable),
            local_desc: Mutex::new(None),
            remote_endpoint: Mutex::new(None),
            local_channels: Mutex::new(Vec::new()),
            on_state: Mutex::new(None),
            on_data_channel: Mutex::new(None),
        });
        self.hub
            .endpoints
            .lock()
            .expect("endpoints")
            .insert(inner.id.clone(), inner.clone());
        Ok(Arc::new(MemoryConnection { inner }))
    }
}

struct ConnInner {
    id: String,
    hub: Weak<Hub>,
    state: Mutex<PeerConnectionState>,
    signaling: Mutex<SignalingState>,
    local_desc: Mutex<Option<SessionDescription>>,
    remote_endpoint: Mutex<Option<String>>,
    local_channels: Mutex<Vec<Arc<ChannelInner>>>,
    on_state: Mutex<Option<StateChangeFn>>,
    on_data_channel: Mutex<Option<DataChannelFn>>,
}

impl ConnInner {
    fn state(&self) -> PeerConnectionState {
        *self.state.lock().expect("state")
    }

    fn transition(&self, next: PeerConnectionState) {
        {
            let mut state = self.state.lock().expect("state");
            if *state == next || *state == PeerConnectionState::Closed {
                return;
            }
            *state = next;
        }
        let cb = self.on_state.lock().expect("on_state").clone();
        if let Some(cb) = cb {
            cb(next);
        }
    }

    fn close_channels(&self) {
        let channels: Vec<Arc<ChannelInner>> = {
            let guard = self.local_channels.lock().expect("channels");
            guard.iter().cloned().collect()
        };
        for ch in channels {
            ch.shutdown(true);
        }
    }

    /// Try to establish the link once both descriptions are in place.
    fn try_link(self: &Arc<Self>) {
        let remote_id = match self.remote_endpoint.lock().expect("remote").clone() {
            Some(id) => id,
            None => return,
        };
        let hub = match self.hub.upgrade() {
            Some(hub) => hub,
            None => return,
        };
        let remote = match hub.endpoints.lock().expect("endpoints").get(&remote_id) {
            Some(r) => r.clone(),
            None => return,
        };
        // The link forms only when the remote also points back at us.
        let reciprocal = remote
            .remote_endpoint
            .lock()
            .expect("remote")
            .as_deref()
            == Some(self.id.as_str());
        if !reciprocal {
            return;
        }
        if self.state() == PeerConnectionState::Connected {
            return;
        }

        self.transition(PeerConnectionState::Connecting);
        remote.transition(PeerConnectionState::Connecting);

        // Pair the initiator's channels with fresh responder halves.
        let locals: Vec<Arc<ChannelInner>> = {
            let guard = self.local_channels.lock().expect("channels");
            guard.iter().cloned().collect()
        };
        for local in locals {
            let far = Arc::new(ChannelInner::new(local.label.clone()));
            far.set_peer(&local);
            local.set_peer(&far);
            remote
                .local_channels
                .lock()
                .expect("channels")
                .push(far.clone());

            let cb = remote.on_data_channel.lock().expect("on_dc").clone();
            if let Some(cb) = cb {
                cb(Arc::new(MemoryChannel { inner: far.clone() }));
            }

            local.open();
            far.open();
        }

        self.transition(PeerConnectionState::Connected);
        remote.transition(PeerConnectionState::Connected);
    }
}

struct MemoryConnection {
    inner: Arc<ConnInner>,
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        if self.inner.state() == PeerConnectionState::Closed {
            return Err(TransportError::ConnectionClosed);
        }
        let ch = Arc::new(ChannelInner::new(label.to_string()));
        self.inner
            .local_channels
            .lock()
            .expect("channels")
            .push(ch.clone());
        Ok(Arc::new(MemoryChannel { inner: ch }))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: self.inner.id.clone(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if *self.inner.signaling.lock().expect("signaling") != SignalingState::HaveRemoteOffer {
            return Err(TransportError::InvalidState(
                "create_answer without a remote offer".into(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: self.inner.id.clone(),
        })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut signaling = self.inner.signaling.lock().expect("signaling");
            *signaling = match desc.kind {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                SdpType::Answer => SignalingState::Stable,
            };
        }
        *self.inner.local_desc.lock().expect("local") = Some(desc);
        // An answer completes our half of the handshake.
        self.inner.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut signaling = self.inner.signaling.lock().expect("signaling");
            *signaling = match desc.kind {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                SdpType::Answer => SignalingState::Stable,
            };
        }
        *self.inner.remote_endpoint.lock().expect("remote") = Some(desc.sdp);
        self.inner.try_link();
        Ok(())
    }

    async fn wait_ice_gathering_complete(&self) -> Result<(), TransportError> {
        // In-process candidates gather instantly.
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.local_desc.lock().expect("local").clone()
    }

    fn signaling_state(&self) -> SignalingState {
        *self.inner.signaling.lock().expect("signaling")
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.inner.state()
    }

    fn set_on_connection_state_change(&self, cb: StateChangeFn) {
        *self.inner.on_state.lock().expect("on_state") = Some(cb);
    }

    fn set_on_data_channel(&self, cb: DataChannelFn) {
        *self.inner.on_data_channel.lock().expect("on_dc") = Some(cb);
    }

    async fn close(&self) {
        self.inner.close_channels();
        self.inner.transition(PeerConnectionState::Closed);

        // The far side observes a disconnect, not a close.
        if let (Some(hub), Some(remote_id)) = (
            self.inner.hub.upgrade(),
            self.inner.remote_endpoint.lock().expect("remote").clone(),
        ) {
            let remote = hub
                .endpoints
                .lock()
                .expect("endpoints")
                .get(&remote_id)
                .cloned();
            if let Some(remote) = remote {
                remote.close_channels();
                remote.transition(PeerConnectionState::Disconnected);
            }
        }

        if let Some(hub) = self.inner.hub.upgrade() {
            hub.endpoints.lock().expect("endpoints").remove(&self.inner.id);
        }
    }
}

struct ChannelInner {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<ChannelInner>>,
    on_open: Mutex<Option<OpenFn>>,
    on_message: Mutex<Option<MessageFn>>,
    on_close: Mutex<Option<CloseFn>>,
    /// Messages delivered before the receiver registered its callback.
    pending: Mutex<Vec<Vec<u8>>>,
}

impl ChannelInner {
    fn new(label: String) -> Self {
        Self {
            label,
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            on_open: Mutex::new(None),
            on_message: Mutex::new(None),
            on_close: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn set_peer(&self, peer: &Arc<ChannelInner>) {
        *self.peer.lock().expect("peer") = Arc::downgrade(peer);
    }

    fn open(&self) {
        {
            let mut state = self.state.lock().expect("state");
            if *state != ChannelState::Connecting {
                return;
            }
            *state = ChannelState::Open;
        }
        let cb = self.on_open.lock().expect("on_open").clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn deliver(&self, data: Vec<u8>) {
        let cb = self.on_message.lock().expect("on_message").clone();
        match cb {
            Some(cb) => cb(&data),
            None => self.pending.lock().expect("pending").push(data),
        }
    }

    fn shutdown(&self, notify_peer: bool) {
        {
            let mut state = self.state.lock().expect("state");
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        let cb = self.on_close.lock().expect("on_close").clone();
        if let Some(cb) = cb {
            cb();
        }
        if notify_peer {
            if let Some(peer) = self.peer.lock().expect("peer").upgrade() {
                peer.shutdown(false);
            }
        }
    }
}

struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.inner.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.inner.state.lock().expect("state")
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.ready_state() != ChannelState::Open {
            return Err(TransportError::ChannelClosed);
        }
        let peer = self
            .inner
            .peer
            .lock()
            .expect("peer")
            .upgrade()
            .ok_or(TransportError::ChannelClosed)?;
        peer.deliver(data.to_vec());
        Ok(())
    }

    fn set_on_open(&self, cb: OpenFn) {
        let already_open = self.ready_state() == ChannelState::Open;
        *self.inner.on_open.lock().expect("on_open") = Some(cb.clone());
        if already_open {
            cb();
        }
    }

    fn set_on_message(&self, cb: MessageFn) {
        let backlog: Vec<Vec<u8>> = {
            let mut pending = self.inner.pending.lock().expect("pending");
            std::mem::take(&mut *pending)
        };
        for data in &backlog {
            cb(data);
        }
        *self.inner.on_message.lock().expect("on_message") = Some(cb);
    }

    fn set_on_close(&self, cb: CloseFn) {
        *self.inner.on_close.lock().expect("on_close") = Some(cb);
    }

    fn close(&self) {
        self.inner.shutdown(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ice() -> IceConfig {
        IceConfig {
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
        }
    }

    /// Run the full non-trickle handshake between two endpoints.
    async fn handshake(
        a: &Arc<dyn PeerConnection>,
        b: &Arc<dyn PeerConnection>,
    ) -> Arc<dyn DataChannel> {
        let ch = a.create_data_channel("data").await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        a.wait_ice_gathering_complete().await.unwrap();
        let offer = a.local_description().await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        b.wait_ice_gathering_complete().await.unwrap();
        let answer = b.local_description().await.unwrap();

        a.set_remote_description(answer).await.unwrap();
        ch
    }

    #[tokio::test]
    async fn test_handshake_connects_both_sides() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        let b = rtc.connector().create_connection(&ice()).await.unwrap();

        let remote_ch: Arc<Mutex<Option<Arc<dyn DataChannel>>>> = Arc::new(Mutex::new(None));
        let remote_ch2 = remote_ch.clone();
        b.set_on_data_channel(Arc::new(move |ch| {
            *remote_ch2.lock().unwrap() = Some(ch);
        }));

        let ch = handshake(&a, &b).await;

        assert_eq!(rtc.endpoint_count(), 2);
        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);
        assert_eq!(ch.ready_state(), ChannelState::Open);

        let far = remote_ch.lock().unwrap().clone().expect("remote channel");
        assert_eq!(far.label(), "data");
        assert_eq!(far.ready_state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        let b = rtc.connector().create_connection(&ice()).await.unwrap();

        let remote_ch: Arc<Mutex<Option<Arc<dyn DataChannel>>>> = Arc::new(Mutex::new(None));
        let remote_ch2 = remote_ch.clone();
        b.set_on_data_channel(Arc::new(move |ch| {
            *remote_ch2.lock().unwrap() = Some(ch);
        }));

        let ch = handshake(&a, &b).await;
        let far = remote_ch.lock().unwrap().clone().unwrap();

        let got: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let got2 = got.clone();
        far.set_on_message(Arc::new(move |data| {
            got2.lock().unwrap().push(data.to_vec());
        }));

        ch.send(b"hello").unwrap();
        ch.send(b"world").unwrap();
        assert_eq!(*got.lock().unwrap(), vec![b"hello".to_vec(), b"world".to_vec()]);

        // Messages sent before the callback was installed are buffered.
        far.send(b"back").unwrap();
        let got_a: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let got_a2 = got_a.clone();
        ch.set_on_message(Arc::new(move |data| {
            got_a2.lock().unwrap().push(data.to_vec());
        }));
        assert_eq!(*got_a.lock().unwrap(), vec![b"back".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_notifies_remote() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        let b = rtc.connector().create_connection(&ice()).await.unwrap();

        let b_states = Arc::new(Mutex::new(Vec::new()));
        let b_states2 = b_states.clone();
        b.set_on_connection_state_change(Arc::new(move |s| {
            b_states2.lock().unwrap().push(s);
        }));

        let _ch = handshake(&a, &b).await;
        a.close().await;

        assert_eq!(a.connection_state(), PeerConnectionState::Closed);
        assert_eq!(b.connection_state(), PeerConnectionState::Disconnected);
        assert!(b_states
            .lock()
            .unwrap()
            .contains(&PeerConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_fail_all_links() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        let b = rtc.connector().create_connection(&ice()).await.unwrap();
        let ch = handshake(&a, &b).await;

        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        ch.set_on_close(Arc::new(move || {
            closes2.fetch_add(1, Ordering::SeqCst);
        }));

        rtc.fail_all_links();
        assert_eq!(a.connection_state(), PeerConnectionState::Failed);
        assert_eq!(b.connection_state(), PeerConnectionState::Failed);
        assert_eq!(ch.ready_state(), ChannelState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(ch.send(b"x").is_err());
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        assert!(a.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_signaling_states() {
        let rtc = MemoryRtc::new();
        let a = rtc.connector().create_connection(&ice()).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
    }
}
