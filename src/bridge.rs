//! Failover controller.
//!
//! The bridge watches heartbeat freshness on the two UDP legs, elects the
//! leg serial-origin traffic should currently use, and emits its own
//! heartbeat on both legs so the peer can reciprocate. A leg is declared
//! lost after [`crate::consts::COMM_LOST_TIMEOUT`] of silence; RADIO_STATUS
//! frames never count as liveness since SiK radios produce them locally.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mavio::dialects::minimal as minimal_dialect;
use mavio::protocol::{MavLinkVersion, Versionless, V1, V2};
use mavio::Frame;

use crate::consts::{
    COMM_LOST_CHECK_INTERVAL, COMM_LOST_TIMEOUT, HEARTBEAT_COMPONENT_ID, HEARTBEAT_INTERVAL,
    HEARTBEAT_SYSTEM_ID, RADIO_STATUS_ID,
};
use crate::errors::{Error, Result};
use crate::link::{LinkEvent, LinkHandle};
use crate::pipeline::{encode_frame, FrameEvent};
use crate::utils::{mpmc, Closer};

/// Tuning knobs of the failover controller. Defaults match the deployed
/// timings; tests compress them.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Cadence of the freshness check.
    pub comm_lost_check_interval: Duration,
    /// Silence threshold after which a leg is declared lost.
    pub comm_lost_timeout: Duration,
    /// Cadence of locally emitted heartbeats.
    pub heartbeat_interval: Duration,
    /// Re-elect the primary leg as soon as it recovers, even while the
    /// secondary is healthy. Disable for sticky selection.
    pub prefer_primary_on_recovery: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            comm_lost_check_interval: COMM_LOST_CHECK_INTERVAL,
            comm_lost_timeout: COMM_LOST_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            prefer_primary_on_recovery: true,
        }
    }
}

/// Which leg the primary slot currently points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Elected {
    Primary,
    Secondary,
    Unset,
}

struct LegStatus {
    link: Arc<LinkHandle>,
    /// Starts `true`: a leg proves itself with its first frame.
    comm_lost: bool,
    last_activity: Instant,
}

impl LegStatus {
    fn new(link: Arc<LinkHandle>) -> Self {
        Self {
            link,
            comm_lost: true,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Legs {
    primary: Option<LegStatus>,
    secondary: Option<LegStatus>,
}

pub struct Bridge {
    config: BridgeConfig,
    legs: Mutex<Legs>,
    /// Weak so a torn-down leg never stays alive through the slot. Readers
    /// upgrade for a single forward and drop the strong handle immediately.
    primary_slot: RwLock<Weak<LinkHandle>>,
    autopilot: RwLock<Weak<LinkHandle>>,
    sequence: AtomicU8,
    state: Closer,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            legs: Mutex::new(Legs::default()),
            primary_slot: RwLock::new(Weak::new()),
            autopilot: RwLock::new(Weak::new()),
            sequence: AtomicU8::new(0),
            state: Closer::new(),
        })
    }

    /// Starts the freshness and heartbeat timers and the frame-event
    /// subscriber. The bridge stops when dropped or on [`Bridge::stop`].
    pub fn start(self: &Arc<Self>, frame_events: mpmc::Receiver<FrameEvent>) {
        {
            let bridge = Arc::downgrade(self);
            let interval = self.config.comm_lost_check_interval;
            thread::spawn(move || loop {
                thread::sleep(interval);
                let Some(bridge) = bridge.upgrade() else { break };
                if bridge.state.is_closed() {
                    break;
                }
                bridge.comm_lost_check();
            });
        }

        {
            let bridge = Arc::downgrade(self);
            let interval = self.config.heartbeat_interval;
            thread::spawn(move || loop {
                {
                    let Some(bridge) = bridge.upgrade() else { break };
                    if bridge.state.is_closed() {
                        break;
                    }
                    bridge.emit_heartbeats();
                }
                thread::sleep(interval);
            });
        }

        {
            let bridge = Arc::downgrade(self);
            thread::spawn(move || loop {
                match frame_events.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => {
                        let Some(bridge) = bridge.upgrade() else { break };
                        bridge.handle_frame(&event.link, &event.frame);
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        let Some(bridge) = bridge.upgrade() else { break };
                        if bridge.state.is_closed() {
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            });
        }
    }

    /// Stops the timers. Heartbeats cease; the elected slot stays readable.
    pub fn stop(&self) {
        self.state.close();
    }

    /// Installs the two UDP legs and runs an initial election. Each leg
    /// starts as lost until its first frame arrives.
    pub fn set_udp_legs(self: &Arc<Self>, primary: &Arc<LinkHandle>, secondary: &Arc<LinkHandle>) {
        {
            let mut legs = self.legs.lock().unwrap();
            legs.primary = Some(LegStatus::new(primary.clone()));
            legs.secondary = Some(LegStatus::new(secondary.clone()));
            self.update_primary(&mut legs);
        }

        self.watch_leg(primary);
        self.watch_leg(secondary);
    }

    /// Registers the autopilot serial link created by the autoconnect probe.
    pub fn set_autopilot_link(&self, link: &Arc<LinkHandle>) {
        *self.autopilot.write().unwrap() = Arc::downgrade(link);
    }

    /// The autopilot serial link, while it is alive.
    pub fn autopilot(&self) -> Option<Arc<LinkHandle>> {
        self.autopilot.read().unwrap().upgrade()
    }

    /// The UDP leg serial-origin traffic should currently be forwarded to.
    pub fn primary(&self) -> Option<Arc<LinkHandle>> {
        self.primary_slot.read().unwrap().upgrade()
    }

    /// Liveness input: every non-RADIO_STATUS frame parsed from a UDP leg
    /// refreshes that leg and revives it if it was lost.
    pub fn handle_frame(&self, link: &Arc<LinkHandle>, frame: &Frame<Versionless>) {
        // SiK-radio link quality report, not a sign of life on the far end.
        if frame.message_id() == RADIO_STATUS_ID {
            return;
        }

        let mut guard = self.legs.lock().unwrap();
        let legs = &mut *guard;
        let mut revived = false;

        for leg in [&mut legs.primary, &mut legs.secondary] {
            let Some(leg) = leg.as_mut() else { continue };
            if !Arc::ptr_eq(&leg.link, link) {
                continue;
            }

            leg.last_activity = Instant::now();
            if leg.comm_lost {
                leg.comm_lost = false;
                log::info!("[{}] leg is alive", leg.link.config().name());
                revived = true;
            }
        }

        if revived {
            self.update_primary(legs);
        }
    }

    /// One freshness tick: declare silent legs lost, then run election.
    pub(crate) fn comm_lost_check(&self) {
        let timeout = self.config.comm_lost_timeout;
        let mut guard = self.legs.lock().unwrap();
        let legs = &mut *guard;

        for leg in [&mut legs.primary, &mut legs.secondary] {
            let Some(leg) = leg.as_mut() else { continue };
            if !leg.comm_lost && leg.last_activity.elapsed() > timeout {
                leg.comm_lost = true;
                log::warn!("[{}] communication lost", leg.link.config().name());
            }
        }

        self.update_primary(legs);
    }

    /// One heartbeat tick: pack a heartbeat on each leg's own channel and
    /// inject it through the leg's thread-safe write. Emitted regardless of
    /// leg state so a silent peer can recover.
    pub(crate) fn emit_heartbeats(&self) {
        let legs = self.legs.lock().unwrap();

        for leg in [&legs.primary, &legs.secondary] {
            let Some(leg) = leg.as_ref() else { continue };

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let bytes = match pack_heartbeat(sequence, leg.link.out_version()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::warn!("failed to pack heartbeat: {err}");
                    continue;
                }
            };

            if let Err(err) = leg.link.write_bytes(&bytes) {
                log::debug!(
                    "[{}] heartbeat not sent: {err}",
                    leg.link.config().name()
                );
            }
        }
    }

    fn current_elected(&self, legs: &Legs) -> Elected {
        let Some(slot) = self.primary_slot.read().unwrap().upgrade() else {
            return Elected::Unset;
        };

        if let Some(leg) = legs.primary.as_ref() {
            if Arc::ptr_eq(&leg.link, &slot) {
                return Elected::Primary;
            }
        }
        if let Some(leg) = legs.secondary.as_ref() {
            if Arc::ptr_eq(&leg.link, &slot) {
                return Elected::Secondary;
            }
        }
        Elected::Unset
    }

    /// Runs election and updates the slot. Returns `true` when the elected
    /// leg changed. No user-visible event is emitted; consumers read the
    /// slot on demand.
    fn update_primary(&self, legs: &mut Legs) -> bool {
        let current = self.current_elected(legs);
        let primary_lost = legs.primary.as_ref().map_or(true, |leg| leg.comm_lost);
        let secondary_lost = legs.secondary.as_ref().map_or(true, |leg| leg.comm_lost);

        let next = elect(
            current,
            primary_lost,
            secondary_lost,
            self.config.prefer_primary_on_recovery,
        );
        if next == current {
            return false;
        }

        let slot = match next {
            Elected::Primary => legs.primary.as_ref().map(|leg| Arc::downgrade(&leg.link)),
            Elected::Secondary => legs.secondary.as_ref().map(|leg| Arc::downgrade(&leg.link)),
            Elected::Unset => None,
        };
        *self.primary_slot.write().unwrap() = slot.unwrap_or_default();

        log::info!("primary UDP leg changed: {next:?}");
        true
    }

    fn watch_leg(self: &Arc<Self>, link: &Arc<LinkHandle>) {
        let bridge = Arc::downgrade(self);
        let name = link.config().name().to_string();
        let link = link.clone();
        let events = link.events();
        let state = link.closed_state();

        thread::spawn(move || {
            loop {
                match events.recv_timeout(Duration::from_millis(500)) {
                    Ok(LinkEvent::Disconnected) => break,
                    Ok(_) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if state.is_closed() {
                            break;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            let Some(bridge) = bridge.upgrade() else { return };
            log::warn!("[{name}] leg disconnected");
            let mut guard = bridge.legs.lock().unwrap();
            let legs = &mut *guard;
            for leg in [&mut legs.primary, &mut legs.secondary] {
                let Some(status) = leg.as_mut() else { continue };
                if Arc::ptr_eq(&status.link, &link) {
                    status.comm_lost = true;
                }
            }
            bridge.update_primary(legs);
        });
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// Election: a pure function of the current slot and both legs' loss flags.
///
/// The primary leg wins whenever it is alive (unless sticky selection keeps
/// a healthy secondary). With both legs lost the slot keeps pointing at a
/// best guess so pending forwards still target a real handle.
pub(crate) fn elect(
    current: Elected,
    primary_lost: bool,
    secondary_lost: bool,
    prefer_primary: bool,
) -> Elected {
    match current {
        Elected::Primary => {
            if !primary_lost {
                Elected::Primary
            } else if !secondary_lost {
                Elected::Secondary
            } else {
                Elected::Primary
            }
        }
        Elected::Secondary => {
            if prefer_primary && !primary_lost {
                Elected::Primary
            } else if !secondary_lost {
                Elected::Secondary
            } else if !primary_lost {
                Elected::Primary
            } else {
                Elected::Primary
            }
        }
        Elected::Unset => {
            if !primary_lost {
                Elected::Primary
            } else if !secondary_lost {
                Elected::Secondary
            } else {
                Elected::Primary
            }
        }
    }
}

/// The heartbeat the bridge announces itself with.
pub(crate) fn heartbeat_message() -> minimal_dialect::messages::Heartbeat {
    use minimal_dialect::enums::{MavAutopilot, MavModeFlag, MavState, MavType};

    minimal_dialect::messages::Heartbeat {
        type_: MavType::Generic,
        autopilot: MavAutopilot::Invalid,
        base_mode: MavModeFlag::MANUAL_INPUT_ENABLED | MavModeFlag::SAFETY_ARMED,
        custom_mode: 0,
        system_status: MavState::Active,
        mavlink_version: 3,
    }
}

/// Packs a heartbeat frame in the version armed for the target channel.
fn pack_heartbeat(sequence: u8, version: MavLinkVersion) -> Result<Vec<u8>> {
    let message = heartbeat_message();
    let builder = Frame::builder()
        .sequence(sequence)
        .system_id(HEARTBEAT_SYSTEM_ID)
        .component_id(HEARTBEAT_COMPONENT_ID);

    match version {
        MavLinkVersion::V1 => {
            let frame = builder
                .version(V1)
                .message(&message)
                .map_err(|err| Error::Frame(err.to_string()))?
                .build();
            encode_frame(&frame)
        }
        MavLinkVersion::V2 => {
            let frame = builder
                .version(V2)
                .message(&message)
                .map_err(|err| Error::Frame(err.to_string()))?
                .build();
            encode_frame(&frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::link::handle::LinkHandle;
    use crate::link::LinkConfig;

    fn udp_handle(name: &str) -> Arc<LinkHandle> {
        LinkHandle::start(Arc::new(LinkConfig::udp(
            name,
            portpicker::pick_unused_port().unwrap(),
        )))
    }

    fn radio_status_frame() -> Frame<Versionless> {
        use mavio::dialects::common::messages::RadioStatus;

        let frame = Frame::builder()
            .sequence(0)
            .system_id(3)
            .component_id(68)
            .version(V2)
            .message(&RadioStatus {
                rssi: 210,
                remrssi: 205,
                txbuf: 100,
                noise: 40,
                remnoise: 35,
                rxerrors: 0,
                fixed: 0,
            })
            .unwrap()
            .build();

        let bytes = encode_frame(&frame).unwrap();
        let mut receiver: mavio::Receiver<_, Versionless> = mavio::Receiver::new(bytes.as_slice());
        receiver.recv().unwrap()
    }

    fn liveness_frame(sequence: u8) -> Frame<Versionless> {
        let frame = Frame::builder()
            .sequence(sequence)
            .system_id(1)
            .component_id(1)
            .version(V2)
            .message(&heartbeat_message())
            .unwrap()
            .build();

        let bytes = encode_frame(&frame).unwrap();
        let mut receiver: mavio::Receiver<_, Versionless> = mavio::Receiver::new(bytes.as_slice());
        receiver.recv().unwrap()
    }

    #[test]
    fn election_keeps_a_live_primary() {
        assert_eq!(elect(Elected::Primary, false, false, true), Elected::Primary);
        assert_eq!(elect(Elected::Primary, false, true, true), Elected::Primary);
    }

    #[test]
    fn election_fails_over_to_a_live_secondary() {
        assert_eq!(
            elect(Elected::Primary, true, false, true),
            Elected::Secondary
        );
    }

    #[test]
    fn election_keeps_best_guess_when_both_lost() {
        assert_eq!(elect(Elected::Primary, true, true, true), Elected::Primary);
        assert_eq!(elect(Elected::Secondary, true, true, true), Elected::Primary);
        assert_eq!(elect(Elected::Unset, true, true, true), Elected::Primary);
    }

    #[test]
    fn election_prefers_recovered_primary() {
        assert_eq!(
            elect(Elected::Secondary, false, false, true),
            Elected::Primary
        );
        assert_eq!(
            elect(Elected::Secondary, false, true, true),
            Elected::Primary
        );
    }

    #[test]
    fn sticky_selection_keeps_a_healthy_secondary() {
        assert_eq!(
            elect(Elected::Secondary, false, false, false),
            Elected::Secondary
        );
        assert_eq!(
            elect(Elected::Secondary, false, true, false),
            Elected::Primary
        );
    }

    #[test]
    fn election_from_unset_picks_whatever_is_alive() {
        assert_eq!(elect(Elected::Unset, false, false, true), Elected::Primary);
        assert_eq!(elect(Elected::Unset, false, true, true), Elected::Primary);
        assert_eq!(elect(Elected::Unset, true, false, true), Elected::Secondary);
    }

    #[test]
    fn election_keeps_secondary_while_primary_is_down() {
        assert_eq!(
            elect(Elected::Secondary, true, false, true),
            Elected::Secondary
        );
    }

    #[test]
    fn legs_start_lost_and_revive_on_first_frame() {
        let bridge = Bridge::new(BridgeConfig::default());
        let primary = udp_handle("Primary UDP");
        let secondary = udp_handle("Secondary UDP");
        bridge.set_udp_legs(&primary, &secondary);

        // Both legs lost: slot points at the primary as best guess.
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &primary));

        bridge.handle_frame(&secondary, &liveness_frame(0));
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &secondary));

        bridge.handle_frame(&primary, &liveness_frame(1));
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &primary));
    }

    #[test]
    fn silence_declares_a_leg_lost() {
        let bridge = Bridge::new(BridgeConfig {
            comm_lost_timeout: Duration::ZERO,
            ..BridgeConfig::default()
        });
        let primary = udp_handle("Primary UDP");
        let secondary = udp_handle("Secondary UDP");
        bridge.set_udp_legs(&primary, &secondary);

        bridge.handle_frame(&primary, &liveness_frame(0));
        bridge.handle_frame(&secondary, &liveness_frame(1));
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &primary));

        // Any elapsed time now exceeds the zero timeout.
        std::thread::sleep(Duration::from_millis(5));
        bridge.comm_lost_check();

        // Both lost again; slot stays on the last known leg.
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &primary));

        bridge.handle_frame(&secondary, &liveness_frame(2));
        assert!(Arc::ptr_eq(&bridge.primary().unwrap(), &secondary));
    }

    #[test]
    fn autopilot_slot_vacates_with_its_link() {
        let bridge = Bridge::new(BridgeConfig::default());
        let autopilot = udp_handle("Not Really Serial");

        bridge.set_autopilot_link(&autopilot);
        assert!(Arc::ptr_eq(&bridge.autopilot().unwrap(), &autopilot));

        drop(autopilot);
        assert!(bridge.autopilot().is_none());
    }

    #[test]
    fn radio_status_does_not_count_as_liveness() {
        let bridge = Bridge::new(BridgeConfig::default());
        let primary = udp_handle("Primary UDP");
        let secondary = udp_handle("Secondary UDP");
        bridge.set_udp_legs(&primary, &secondary);

        bridge.handle_frame(&primary, &radio_status_frame());

        let legs = bridge.legs.lock().unwrap();
        assert!(legs.primary.as_ref().unwrap().comm_lost);
    }

    #[test]
    fn heartbeat_packs_as_mavlink1() {
        let bytes = pack_heartbeat(0, MavLinkVersion::V1).unwrap();
        assert_eq!(bytes[0], 0xFE);

        let bytes = pack_heartbeat(0, MavLinkVersion::V2).unwrap();
        assert_eq!(bytes[0], 0xFD);
    }
}
