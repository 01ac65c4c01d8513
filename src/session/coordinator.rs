use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::permission::PermissionGate;
use super::state::{SessionClient, SessionError, SessionEvent, SessionMode, SessionState};
use crate::config::AudioConfig;
use crate::hardware::{
    AudioHardware, HardwareEvent, InterruptionPhase, RecordPermission, RouteChangeReason,
    SessionConfiguration,
};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

enum SessionCommand {
    Configure {
        client: SessionClient,
        mode: SessionMode,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Deactivate {
        client: SessionClient,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    RefreshRoute {
        reply: oneshot::Sender<()>,
    },
}

/// Single owner of the hardware audio session and of microphone permission.
///
/// Create one per process with [`SessionCoordinator::spawn`] and hand clones to
/// the recorder and the player. All state changes happen on one actor task;
/// hardware notifications are forwarded into that task before they touch state.
///
/// Each client holds a lease on a [`SessionMode`]. The hardware is configured
/// for the union of all leased modes and released only when the last lease is
/// returned, so neither peer can tear down the other's access.
#[derive(Clone)]
pub struct SessionCoordinator {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    hardware: Arc<dyn AudioHardware>,
    permission: Arc<PermissionGate>,
}

impl SessionCoordinator {
    /// Start the coordinator task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: &AudioConfig,
        hardware: Arc<dyn AudioHardware>,
        hardware_events: mpsc::Receiver<HardwareEvent>,
    ) -> Self {
        let route = hardware.current_route();
        let initial = SessionState {
            current_route_name: route.name(),
            has_external_output: route.has_external_output(),
            ..SessionState::default()
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);

        let actor = SessionActor {
            config: config.clone(),
            hardware: hardware.clone(),
            commands: commands_rx,
            hardware_events,
            state: state_tx,
            events: events_tx.clone(),
            leases: HashMap::new(),
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            hardware,
            permission: Arc::new(PermissionGate::default()),
        }
    }

    /// Configure and activate the hardware for `mode` on behalf of a direct caller.
    pub async fn configure(&self, mode: SessionMode) -> Result<(), SessionError> {
        self.configure_for(SessionClient::External, mode).await
    }

    /// Return the direct caller's lease. Succeeds immediately when inactive.
    pub async fn deactivate(&self) -> Result<(), SessionError> {
        self.deactivate_for(SessionClient::External).await
    }

    /// Lease the session for `mode`, merged with every other active lease.
    pub async fn configure_for(
        &self,
        client: SessionClient,
        mode: SessionMode,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let stopped = || SessionError::ConfigurationFailed("session coordinator stopped".into());
        self.commands
            .send(SessionCommand::Configure { client, mode, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Return `client`'s lease; the hardware is released with the last lease.
    pub async fn deactivate_for(&self, client: SessionClient) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        let stopped = || SessionError::DeactivationFailed("session coordinator stopped".into());
        self.commands
            .send(SessionCommand::Deactivate { client, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Re-read the active route. Safe to call redundantly.
    pub async fn refresh_route(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::RefreshRoute { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Ask for microphone access, prompting at most once at a time.
    ///
    /// Returns immediately when the answer is already known. Denial is final
    /// until the user changes it in system settings.
    pub async fn request_microphone_permission(&self) -> bool {
        self.permission.request(&self.hardware).await
    }

    pub fn has_microphone_permission(&self) -> bool {
        self.hardware.record_permission() == RecordPermission::Granted
    }

    pub async fn ensure_microphone_permission(&self) -> Result<(), SessionError> {
        if self.request_microphone_permission().await {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied)
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Interruption and route-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

struct SessionActor {
    config: AudioConfig,
    hardware: Arc<dyn AudioHardware>,
    commands: mpsc::Receiver<SessionCommand>,
    hardware_events: mpsc::Receiver<HardwareEvent>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    leases: HashMap<SessionClient, SessionMode>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.hardware_events.recv() => self.handle_hardware_event(event),
            }
        }
        log::debug!("Session coordinator stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Configure {
                client,
                mode,
                reply,
            } => {
                let result = self.configure(client, mode).await;
                let _ = reply.send(result);
            }
            SessionCommand::Deactivate { client, reply } => {
                let result = self.deactivate(client).await;
                let _ = reply.send(result);
            }
            SessionCommand::RefreshRoute { reply } => {
                self.refresh_route();
                let _ = reply.send(());
            }
        }
    }

    async fn configure(
        &mut self,
        client: SessionClient,
        mode: SessionMode,
    ) -> Result<(), SessionError> {
        let mut leases = self.leases.clone();
        leases.insert(client, mode);
        let target = leases
            .values()
            .fold(SessionMode::Idle, |merged, mode| merged.merge(*mode));

        let (current_mode, is_active) = {
            let state = self.state.borrow();
            (state.mode, state.is_active)
        };

        // Never downgrade while a peer still holds a lease.
        let target = if is_active {
            target.merge(current_mode)
        } else {
            target
        };

        if is_active && current_mode == target {
            self.leases = leases;
            log::debug!("{:?} joined active session in {:?}", client, target);
            return Ok(());
        }

        let configuration = SessionConfiguration::for_mode(target, &self.config);
        if let Err(e) = self.hardware.apply(&configuration).await {
            log::error!("Failed to configure audio session for {:?}: {:#}", target, e);
            return Err(SessionError::ConfigurationFailed(format!("{:#}", e)));
        }

        if !is_active {
            if let Err(e) = self.hardware.set_active(true).await {
                log::error!("Failed to activate audio session: {:#}", e);
                return Err(SessionError::ActivationFailed(format!("{:#}", e)));
            }
        }

        self.leases = leases;
        self.state.send_modify(|state| {
            state.mode = target;
            state.is_active = true;
        });
        self.refresh_route();
        log::info!(
            "Audio session active: mode={:?}, category={:?}, requested by {:?}",
            target,
            configuration.category,
            client
        );
        Ok(())
    }

    async fn deactivate(&mut self, client: SessionClient) -> Result<(), SessionError> {
        self.leases.remove(&client);

        if !self.state.borrow().is_active {
            return Ok(());
        }
        if !self.leases.is_empty() {
            log::debug!(
                "{:?} released its lease; session kept for {:?}",
                client,
                self.leases.keys().collect::<Vec<_>>()
            );
            return Ok(());
        }

        if let Err(e) = self.hardware.set_active(false).await {
            log::error!("Failed to deactivate audio session: {:#}", e);
            return Err(SessionError::DeactivationFailed(format!("{:#}", e)));
        }

        self.state.send_modify(|state| {
            state.mode = SessionMode::Idle;
            state.is_active = false;
        });
        log::info!("Audio session deactivated by {:?}", client);
        Ok(())
    }

    fn handle_hardware_event(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::Interruption(InterruptionPhase::Began) => {
                log::warn!("Audio session interrupted");
                // The platform has taken the hardware; every lease is void.
                self.leases.clear();
                self.state.send_modify(|state| {
                    state.mode = SessionMode::Idle;
                    state.is_active = false;
                });
                let _ = self.events.send(SessionEvent::InterruptionBegan);
            }
            HardwareEvent::Interruption(InterruptionPhase::Ended { should_resume }) => {
                log::info!("Audio session interruption ended, should_resume={}", should_resume);
                let _ = self
                    .events
                    .send(SessionEvent::InterruptionEnded { should_resume });
            }
            HardwareEvent::RouteChanged(reason) => {
                self.refresh_route();
                let (route_name, has_external_output) = {
                    let state = self.state.borrow();
                    (state.current_route_name.clone(), state.has_external_output)
                };
                log::info!(
                    "Audio route changed ({:?}): {} external={}",
                    reason,
                    route_name,
                    has_external_output
                );
                let _ = self.events.send(SessionEvent::RouteChanged {
                    reason,
                    route_name,
                    has_external_output,
                });
            }
        }
    }

    fn refresh_route(&mut self) {
        let route = self.hardware.current_route();
        let name = route.name();
        let external = route.has_external_output();
        self.state.send_if_modified(|state| {
            if state.current_route_name == name && state.has_external_output == external {
                return false;
            }
            state.current_route_name = name;
            state.has_external_output = external;
            true
        });
    }
}

/// Reasons that mean the previous output device went away.
pub(crate) fn is_output_lost(reason: RouteChangeReason) -> bool {
    matches!(
        reason,
        RouteChangeReason::OldDeviceUnavailable | RouteChangeReason::NoSuitableRouteForCategory
    )
}
