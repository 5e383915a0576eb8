//! Intercom call coordinator.
//!
//! [`CallCoordinator`] is a handle to a single actor task that owns the
//! device's [`CallSession`]. Local commands (dial, answer, mute...) arrive
//! over an mpsc channel with a oneshot reply; signaling envelopes arrive on
//! the participant's inbox. Both are handled one at a time, so the session
//! is never touched concurrently.
//!
//! Every change is published as a [`CallSnapshot`] on a `watch` channel.
//! Dropping the handle (or calling [`CallCoordinator::shutdown`]) forces a
//! hangup of any live call.

use std::sync::Arc;
use std::time::Duration;

use porteiro_core::call_state::{next_state, CallEvent, CallState, EndReason};
use porteiro_core::error::CoreError;
use porteiro_core::signaling::{Participant, SignalEnvelope, SignalMessage};
use porteiro_core::types::EntityId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::session::{CallDirection, CallSession, CallSnapshot};
use crate::signaling::{SignalingChannel, SignalingError};

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long `dialing`/`ringing` may last without an answer.
    pub ring_timeout: Duration,
    /// Capacity of the command queue.
    pub command_buffer: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(45),
            command_buffer: 32,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Invalid state transition: {event} is not allowed in state {from}")]
    InvalidTransition { from: CallState, event: CallEvent },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call coordinator is no longer running")]
    CoordinatorGone,
}

impl From<CoreError> for CallError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidTransition { from, event } => Self::InvalidTransition { from, event },
            CoreError::Validation(msg) => Self::Validation(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Dial { target: Participant, reply: Reply<Uuid> },
    Answer { reply: Reply<()> },
    Decline { reply: Reply<()> },
    EndCall { reason: EndReason, reply: Reply<()> },
    ToggleMute { reply: Reply<bool> },
    ToggleSpeaker { reply: Reply<bool> },
    MediaReady { reply: Reply<()> },
    Joined { reply: Reply<()> },
    ParticipantJoined { participant: Participant, reply: Reply<()> },
    ParticipantLeft { participant_id: EntityId, reply: Reply<()> },
    ReportError { message: String, reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the call actor of one device.
pub struct CallCoordinator {
    local: Participant,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<CallSnapshot>,
    task: JoinHandle<()>,
}

impl CallCoordinator {
    /// Spawn the actor for `local`, reading signaling envelopes from `inbox`.
    pub fn spawn(
        local: Participant,
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        inbox: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (snapshot_tx, snapshots) = watch::channel(CallSnapshot::idle());

        let actor = Actor {
            local: local.clone(),
            config,
            signaling,
            session: None,
            ring_deadline: None,
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, inbox));

        Self {
            local,
            commands,
            snapshots,
            task,
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| CallError::CoordinatorGone)?;
        rx.await.map_err(|_| CallError::CoordinatorGone)?
    }

    /// Start a call to `target`. Only valid from `idle`/`ended`.
    pub async fn dial(&self, target: Participant) -> Result<Uuid, CallError> {
        self.request(|reply| Command::Dial { target, reply }).await
    }

    /// Pick up the incoming call that is ringing.
    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    /// Reject the incoming call that is ringing.
    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// Hang up the live call; the peer is told `reason`.
    pub async fn end_call(&self, reason: EndReason) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reason, reply }).await
    }

    /// Flip the local mute flag. Outside `connected` this is a no-op that
    /// returns the unchanged flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Flip the speaker flag. Same rules as [`toggle_mute`](Self::toggle_mute).
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleSpeaker { reply }).await
    }

    /// The local media layer is ready; `connecting -> rtc_joining`.
    pub async fn media_ready(&self) -> Result<(), CallError> {
        self.request(|reply| Command::MediaReady { reply }).await
    }

    /// The local media layer joined the channel; `rtc_joining -> connected`.
    pub async fn joined(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Joined { reply }).await
    }

    pub async fn participant_joined(&self, participant: Participant) -> Result<(), CallError> {
        self.request(|reply| Command::ParticipantJoined { participant, reply })
            .await
    }

    pub async fn participant_left(&self, participant_id: impl Into<EntityId>) -> Result<(), CallError> {
        let participant_id = participant_id.into();
        self.request(|reply| Command::ParticipantLeft {
            participant_id,
            reply,
        })
        .await
    }

    /// Record a media or signaling failure and end the live call.
    pub async fn report_error(&self, message: impl Into<String>) -> Result<(), CallError> {
        let message = message.into();
        self.request(|reply| Command::ReportError { message, reply })
            .await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }

    /// Hang up any live call and stop the actor.
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = self.task.await {
            tracing::error!(participant_id = %self.local.id, error = %e, "Call coordinator task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    local: Participant,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    /// `None` until the first call; kept in `ended` afterwards.
    session: Option<CallSession>,
    /// Armed while the session is in `dialing`/`ringing`.
    ring_deadline: Option<Instant>,
    snapshots: watch::Sender<CallSnapshot>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<SignalEnvelope>,
    ) {
        let mut inbox_open = true;

        loop {
            let deadline = self.ring_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                envelope = inbox.recv(), if inbox_open => match envelope {
                    Some(envelope) => self.handle_signal(envelope).await,
                    None => {
                        tracing::warn!(participant_id = %self.local.id, "Signaling inbox closed");
                        inbox_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.ring_timeout().await;
                }
            }
        }
        tracing::debug!(participant_id = %self.local.id, "Call coordinator stopped");
    }

    fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    fn publish(&self) {
        let snapshot = self
            .session
            .as_ref()
            .map(CallSession::snapshot)
            .unwrap_or_else(CallSnapshot::idle);
        self.snapshots.send_replace(snapshot);
    }

    fn reject(&self, err: CoreError) -> CallError {
        tracing::warn!(participant_id = %self.local.id, error = %err, "Rejected call transition");
        err.into()
    }

    async fn signal(&self, to: &str, message: SignalMessage) -> Result<(), SignalingError> {
        tracing::debug!(
            participant_id = %self.local.id,
            to,
            kind = message.kind(),
            call_id = %message.call_id(),
            "Sending signal",
        );
        self.signaling
            .send(SignalEnvelope {
                from: self.local.id.clone(),
                to: to.to_string(),
                message,
            })
            .await
    }

    /// Send a signal whose loss does not affect the call.
    async fn notify(&self, to: &str, message: SignalMessage) {
        let kind = message.kind();
        if let Err(e) = self.signal(to, message).await {
            tracing::warn!(participant_id = %self.local.id, kind, error = %e, "Failed to notify peer");
        }
    }

    fn arm_ring_timer(&mut self) {
        self.ring_deadline = Some(Instant::now() + self.config.ring_timeout);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { target, reply } => {
                let _ = reply.send(self.dial(target).await);
            }
            Command::Answer { reply } => {
                let _ = reply.send(self.answer().await);
            }
            Command::Decline { reply } => {
                let _ = reply.send(self.decline().await);
            }
            Command::EndCall { reason, reply } => {
                let _ = reply.send(self.end_call(reason).await);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(Ok(self.toggle_mute().await));
            }
            Command::ToggleSpeaker { reply } => {
                let _ = reply.send(Ok(self.toggle_speaker().await));
            }
            Command::MediaReady { reply } => {
                let _ = reply.send(self.media_ready().await);
            }
            Command::Joined { reply } => {
                let _ = reply.send(self.joined().await);
            }
            Command::ParticipantJoined { participant, reply } => {
                self.participant_joined(participant);
                let _ = reply.send(Ok(()));
            }
            Command::ParticipantLeft {
                participant_id,
                reply,
            } => {
                self.participant_left(&participant_id).await;
                let _ = reply.send(Ok(()));
            }
            Command::ReportError { message, reply } => {
                let _ = reply.send(self.report_error(message).await);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn dial(&mut self, target: Participant) -> Result<Uuid, CallError> {
        next_state(self.state(), CallEvent::Dial).map_err(|e| self.reject(e))?;

        let call_id = Uuid::new_v4();
        self.session = Some(CallSession::outgoing(call_id, target.clone()));
        self.arm_ring_timer();
        self.publish();
        tracing::info!(participant_id = %self.local.id, peer = %target.id, call_id = %call_id, "Dialing");

        let invite = SignalMessage::Invite {
            call_id,
            from: self.local.clone(),
        };
        if let Err(e) = self.signal(&target.id, invite).await {
            self.fail(format!("invite failed: {e}"), false).await;
            return Err(e.into());
        }
        Ok(call_id)
    }

    async fn answer(&mut self) -> Result<(), CallError> {
        let (call_id, peer_id) = match &self.session {
            Some(s) if s.direction == CallDirection::Incoming => (s.call_id, s.peer.id.clone()),
            _ => {
                return Err(self.reject(CoreError::InvalidTransition {
                    from: self.state(),
                    event: CallEvent::Answer,
                }))
            }
        };
        self.transition(CallEvent::Answer)?;
        self.ring_deadline = None;
        self.publish();
        tracing::info!(participant_id = %self.local.id, call_id = %call_id, "Call answered");

        if let Err(e) = self.signal(&peer_id, SignalMessage::Accept { call_id }).await {
            self.fail(format!("accept failed: {e}"), false).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        let incoming_ringing = self
            .session
            .as_ref()
            .is_some_and(|s| s.direction == CallDirection::Incoming && s.state == CallState::Ringing);
        if !incoming_ringing {
            return Err(self.reject(CoreError::InvalidTransition {
                from: self.state(),
                event: CallEvent::Hangup,
            }));
        }
        self.end_session(CallEvent::Hangup, EndReason::Declined, true)
            .await
    }

    async fn end_call(&mut self, reason: EndReason) -> Result<(), CallError> {
        self.end_session(CallEvent::Hangup, reason, true).await
    }

    async fn toggle_mute(&mut self) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.state == CallState::Connected) else {
            tracing::debug!(participant_id = %self.local.id, state = %self.state(), "Mute toggle ignored outside a connected call");
            return self.session.as_ref().is_some_and(|s| s.is_muted);
        };
        session.is_muted = !session.is_muted;
        let (muted, call_id, peer_id) = (session.is_muted, session.call_id, session.peer.id.clone());
        self.publish();
        self.notify(&peer_id, SignalMessage::MuteChanged { call_id, muted })
            .await;
        muted
    }

    async fn toggle_speaker(&mut self) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.state == CallState::Connected) else {
            tracing::debug!(participant_id = %self.local.id, state = %self.state(), "Speaker toggle ignored outside a connected call");
            return self.session.as_ref().is_some_and(|s| s.is_speaker_on);
        };
        session.is_speaker_on = !session.is_speaker_on;
        let (speaker_on, call_id, peer_id) =
            (session.is_speaker_on, session.call_id, session.peer.id.clone());
        self.publish();
        self.notify(&peer_id, SignalMessage::SpeakerChanged { call_id, speaker_on })
            .await;
        speaker_on
    }

    async fn media_ready(&mut self) -> Result<(), CallError> {
        let (call_id, peer_id) = self.transition(CallEvent::MediaReady)?;
        self.publish();
        self.notify(&peer_id, SignalMessage::MediaReady { call_id })
            .await;
        Ok(())
    }

    async fn joined(&mut self) -> Result<(), CallError> {
        let (call_id, peer_id) = self.transition(CallEvent::Joined)?;
        if let Some(session) = self.session.as_mut() {
            session.add_participant(self.local.clone());
        }
        self.publish();
        tracing::info!(participant_id = %self.local.id, call_id = %call_id, "Call connected");

        let participant = self.local.clone();
        self.notify(&peer_id, SignalMessage::Joined { call_id, participant })
            .await;
        Ok(())
    }

    fn participant_joined(&mut self, participant: Participant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.add_participant(participant.clone()) {
            self.publish();
        } else {
            tracing::debug!(
                participant_id = %self.local.id,
                joined = %participant.id,
                state = %session.state,
                "Participant update ignored",
            );
        }
    }

    async fn participant_left(&mut self, participant_id: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.remove_participant(participant_id) {
            return;
        }
        let peer_dropped = session.peer.id == participant_id && session.state == CallState::Connected;
        self.publish();

        if peer_dropped {
            tracing::info!(participant_id = %self.local.id, peer = participant_id, "Peer left the call");
            let _ = self
                .end_session(CallEvent::RemoteHangup, EndReason::RemoteHangup, false)
                .await;
        }
    }

    async fn report_error(&mut self, message: String) -> Result<(), CallError> {
        if !self.state().is_active() {
            tracing::warn!(participant_id = %self.local.id, error = %message, "Error reported with no live call");
            return Err(self.reject(CoreError::InvalidTransition {
                from: self.state(),
                event: CallEvent::Error,
            }));
        }
        self.fail(message, true).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signals from the peer
    // -----------------------------------------------------------------------

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, message, .. } = envelope;
        tracing::debug!(
            participant_id = %self.local.id,
            from = %from,
            kind = message.kind(),
            call_id = %message.call_id(),
            "Signal received",
        );

        if let SignalMessage::Invite { call_id, from: caller } = message {
            self.handle_invite(call_id, caller).await;
            return;
        }

        let call_id = message.call_id();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.call_id != call_id || session.peer.id != from || !session.state.is_active() {
            tracing::debug!(participant_id = %self.local.id, call_id = %call_id, "Ignoring signal for another call");
            return;
        }

        match message {
            SignalMessage::Ring { .. } => {
                if session.state == CallState::Dialing && session.apply(CallEvent::PeerRings).is_ok() {
                    self.publish();
                } else {
                    tracing::debug!(participant_id = %self.local.id, call_id = %call_id, "Stale ring ignored");
                }
            }
            SignalMessage::Accept { .. } => {
                if session.direction == CallDirection::Outgoing
                    && session.state.is_ringing_phase()
                    && session.apply(CallEvent::PeerAccepts).is_ok()
                {
                    self.ring_deadline = None;
                    self.publish();
                    tracing::info!(participant_id = %self.local.id, call_id = %call_id, "Call accepted");
                } else {
                    tracing::debug!(participant_id = %self.local.id, call_id = %call_id, "Duplicate accept ignored");
                }
            }
            SignalMessage::Hangup { reason, .. } => {
                let reason = EndReason::from_remote(reason.as_deref());
                let _ = self
                    .end_session(CallEvent::RemoteHangup, reason, false)
                    .await;
            }
            SignalMessage::MuteChanged { muted, .. } => {
                session.remote_muted = muted;
                self.publish();
            }
            SignalMessage::SpeakerChanged { speaker_on, .. } => {
                session.remote_speaker_on = speaker_on;
                self.publish();
            }
            SignalMessage::MediaReady { .. } => {}
            SignalMessage::Joined { participant, .. } => {
                if session.add_participant(participant) {
                    self.publish();
                }
            }
            SignalMessage::Invite { .. } => {}
        }
    }

    async fn handle_invite(&mut self, call_id: Uuid, caller: Participant) {
        // Redelivery of the current call's invite, live or already ended.
        if self.session.as_ref().is_some_and(|s| s.call_id == call_id) {
            tracing::debug!(participant_id = %self.local.id, call_id = %call_id, "Duplicate invite ignored");
            return;
        }

        if self.session.as_ref().is_some_and(|s| s.state.is_active()) {
            tracing::info!(
                participant_id = %self.local.id,
                caller = %caller.id,
                call_id = %call_id,
                "Busy, declining invite",
            );
            self.notify(
                &caller.id,
                SignalMessage::Hangup {
                    call_id,
                    reason: Some(EndReason::Busy.as_str().to_string()),
                },
            )
            .await;
            return;
        }

        if let Err(e) = next_state(self.state(), CallEvent::InviteReceived) {
            self.reject(e);
            return;
        }

        self.session = Some(CallSession::incoming(call_id, caller.clone()));
        self.arm_ring_timer();
        self.publish();
        tracing::info!(participant_id = %self.local.id, caller = %caller.id, call_id = %call_id, "Incoming call");

        if let Err(e) = self.signal(&caller.id, SignalMessage::Ring { call_id }).await {
            self.fail(format!("ring failed: {e}"), false).await;
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Apply `event` to the live session, returning its call id and peer.
    fn transition(&mut self, event: CallEvent) -> Result<(Uuid, EntityId), CallError> {
        let result = match self.session.as_mut() {
            Some(session) => session
                .apply(event)
                .map(|_| (session.call_id, session.peer.id.clone())),
            None => Err(CoreError::InvalidTransition {
                from: CallState::Idle,
                event,
            }),
        };
        result.map_err(|e| self.reject(e))
    }

    /// Move the live session through `ending` to `ended`.
    ///
    /// With `notify_peer` a best-effort `hangup` carrying `reason` is sent.
    async fn end_session(
        &mut self,
        event: CallEvent,
        reason: EndReason,
        notify_peer: bool,
    ) -> Result<(), CallError> {
        let (call_id, peer_id) = self.transition(event)?;
        self.ring_deadline = None;
        self.publish();

        if notify_peer {
            self.notify(
                &peer_id,
                SignalMessage::Hangup {
                    call_id,
                    reason: Some(reason.as_str().to_string()),
                },
            )
            .await;
        }

        if let Some(session) = self.session.as_mut() {
            session.finish(reason).map_err(|e| self.reject(e))?;
        }
        self.publish();
        tracing::info!(participant_id = %self.local.id, call_id = %call_id, reason = %reason, "Call ended");
        Ok(())
    }

    /// Record `message` as the session error and end the call.
    async fn fail(&mut self, message: String, notify_peer: bool) {
        tracing::error!(participant_id = %self.local.id, error = %message, "Call failed");
        if let Some(session) = self.session.as_mut() {
            session.error = Some(message);
        }
        let _ = self
            .end_session(CallEvent::Error, EndReason::Error, notify_peer)
            .await;
    }

    async fn ring_timeout(&mut self) {
        self.ring_deadline = None;
        if !self.state().is_ringing_phase() {
            return;
        }
        tracing::info!(participant_id = %self.local.id, "Ring timeout, ending call");
        if let Some(session) = self.session.as_mut() {
            session.error = Some(EndReason::Timeout.as_str().to_string());
        }
        let _ = self
            .end_session(CallEvent::RemoteHangup, EndReason::Timeout, true)
            .await;
    }

    /// Force a hangup when the owner goes away with a live call.
    async fn teardown(&mut self) {
        if self.state().is_active() {
            tracing::info!(participant_id = %self.local.id, "Coordinator shutting down, forcing hangup");
            let _ = self
                .end_session(CallEvent::Hangup, EndReason::Teardown, true)
                .await;
        }
    }
}
