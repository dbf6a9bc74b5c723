//! Link registry.
//!
//! Owns the set of configurations and the parallel set of live links.
//! Creation allocates a parser channel, wires the link's events to the frame
//! pipeline and to the internal disconnect handler, and issues `connect`.
//! Teardown is driven by the link's `Disconnected` event: the channel is
//! freed and the handle removed once the worker reports the endpoint gone.

use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Instant;

use crate::channel::{ChannelAllocator, INVALID_CHANNEL};
use crate::consts::{
    CONNECT_TIMEOUT, DISCONNECT_TIMEOUT, FORWARDING_LINK_NAME, PRIMARY_UDP_LINK_NAME,
    SECONDARY_UDP_LINK_NAME,
};
use crate::errors::{Error, Result};
use crate::link::handle::LinkHandle;
use crate::link::{LinkConfig, LinkEvent};
use crate::pipeline::Pipeline;
use crate::settings;
use crate::utils::mpmc;

pub struct LinkRegistry {
    allocator: Mutex<ChannelAllocator>,
    configs: Mutex<Vec<Arc<LinkConfig>>>,
    links: Mutex<Vec<Arc<LinkHandle>>>,
    pipeline: OnceLock<Weak<Pipeline>>,
}

impl LinkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            allocator: Mutex::new(ChannelAllocator::new()),
            configs: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
            pipeline: OnceLock::new(),
        })
    }

    /// Wires the frame pipeline in. Called once during bootstrap; links
    /// created before this never get a decoder.
    pub(crate) fn set_pipeline(&self, pipeline: &Arc<Pipeline>) {
        let _ = self.pipeline.set(Arc::downgrade(pipeline));
    }

    /// Stores a configuration and returns the shared reference under which
    /// it is tracked.
    pub fn add_configuration(&self, config: LinkConfig) -> Arc<LinkConfig> {
        let config = Arc::new(config);
        self.configs.lock().unwrap().push(config.clone());
        config
    }

    pub fn configurations(&self) -> Vec<Arc<LinkConfig>> {
        self.configs.lock().unwrap().clone()
    }

    /// Drops a configuration, disconnecting its live link first.
    pub fn remove_configuration(&self, config: &Arc<LinkConfig>) {
        if let Some(link) = self.link_for_config(config) {
            link.disconnect();
        }

        let mut configs = self.configs.lock().unwrap();
        match configs.iter().position(|c| Arc::ptr_eq(c, config)) {
            Some(index) => {
                configs.remove(index);
            }
            None => log::warn!("remove_configuration called with unknown config"),
        }
    }

    /// Creates the variant-appropriate link for `config`, connects it, and
    /// waits for the session outcome. On any failure the channel is freed
    /// and the link is removed again.
    pub fn create_connected_link(
        self: &Arc<Self>,
        config: &Arc<LinkConfig>,
    ) -> Result<Arc<LinkHandle>> {
        let channel = self.allocator.lock().unwrap().allocate();
        if channel == INVALID_CHANNEL {
            log::warn!("[{}] link failed to set up a parser channel", config.name());
            return Err(Error::Allocation);
        }

        let link = LinkHandle::start(config.clone());
        let out_version = self.allocator.lock().unwrap().out_version(channel);
        link.set_channel(channel, out_version);
        self.links.lock().unwrap().push(link.clone());

        // Subscribe before connect so no session event is missed.
        let wait_events = link.events();
        self.spawn_monitor(&link);

        if let Some(pipeline) = self.pipeline.get().and_then(Weak::upgrade) {
            pipeline.attach(&link);
        }

        if let Err(err) = link.connect() {
            self.teardown(&link);
            return Err(err);
        }

        match self.await_session(&wait_events) {
            Ok(()) => Ok(link),
            Err(err) => {
                log::warn!("[{}] connect failed: {err}", config.name());
                self.teardown(&link);
                Err(err)
            }
        }
    }

    fn await_session(&self, events: &mpmc::Receiver<LinkEvent>) -> Result<()> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(LinkEvent::Connected) => return Ok(()),
                Ok(LinkEvent::Error(detail)) => return Err(Error::Transport(detail)),
                Ok(LinkEvent::Disconnected) => {
                    return Err(Error::Transport("link closed during connect".to_string()))
                }
                Ok(_) => continue,
                Err(_) => return Err(Error::Transport("connect timed out".to_string())),
            }
        }
    }

    /// Forwards transport errors and reacts to the end of the session.
    fn spawn_monitor(self: &Arc<Self>, link: &Arc<LinkHandle>) {
        let registry = Arc::downgrade(self);
        let link = link.clone();
        let events = link.events();
        let state = link.closed_state();

        thread::spawn(move || {
            loop {
                match events.recv_timeout(std::time::Duration::from_millis(500)) {
                    Ok(LinkEvent::Error(detail)) => {
                        let title = if link.config().is_serial() {
                            "Serial Link Error"
                        } else {
                            "UDP Link Error"
                        };
                        log::error!("{title}: link {}: {detail}", link.config().name());
                    }
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

            if let Some(registry) = registry.upgrade() {
                registry.on_link_disconnected(&link);
            }
        });
    }

    fn on_link_disconnected(&self, link: &Arc<LinkHandle>) {
        let channel = link.take_channel();
        if channel != INVALID_CHANNEL {
            self.allocator.lock().unwrap().free(channel);
        }

        let mut links = self.links.lock().unwrap();
        if let Some(index) = links.iter().position(|l| Arc::ptr_eq(l, link)) {
            log::debug!("[{}] link removed from registry", link.config().name());
            links.remove(index);
        }
    }

    fn teardown(&self, link: &Arc<LinkHandle>) {
        link.shutdown();
        self.on_link_disconnected(link);
    }

    /// The autopilot leg: the first live serial link.
    pub fn autopilot_link(&self) -> Option<Arc<LinkHandle>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|link| link.config().is_serial())
            .cloned()
    }

    pub fn primary_udp_link(&self) -> Option<Arc<LinkHandle>> {
        self.udp_link_named(PRIMARY_UDP_LINK_NAME)
    }

    pub fn secondary_udp_link(&self) -> Option<Arc<LinkHandle>> {
        self.udp_link_named(SECONDARY_UDP_LINK_NAME)
    }

    pub fn forwarding_link(&self) -> Option<Arc<LinkHandle>> {
        self.udp_link_named(FORWARDING_LINK_NAME)
    }

    fn udp_link_named(&self, name: &str) -> Option<Arc<LinkHandle>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|link| link.config().is_udp() && link.config().name() == name)
            .cloned()
    }

    /// Returns the owning shared reference for a raw handle, if the link is
    /// still live.
    pub fn shared(&self, link: &LinkHandle) -> Option<Arc<LinkHandle>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|l| std::ptr::eq(l.as_ref(), link))
            .cloned()
    }

    pub fn contains(&self, link: &LinkHandle) -> bool {
        self.shared(link).is_some()
    }

    /// The live link created from `config`, if any.
    pub fn link_for_config(&self, config: &Arc<LinkConfig>) -> Option<Arc<LinkHandle>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|link| Arc::ptr_eq(link.config(), config))
            .cloned()
    }

    /// Returns `true` when a live serial link already owns `path`.
    pub fn serial_port_connected(&self, path: &str) -> bool {
        self.links.lock().unwrap().iter().any(|link| {
            link.config()
                .serial_settings()
                .is_some_and(|settings| settings.port_path == path)
        })
    }

    pub fn live_links(&self) -> Vec<Arc<LinkHandle>> {
        self.links.lock().unwrap().clone()
    }

    /// Raw channel allocation bitmask; zero when no link holds a channel.
    pub fn channel_mask(&self) -> u16 {
        self.allocator.lock().unwrap().mask()
    }

    /// Issues `disconnect` on every live link. Entries are freed as their
    /// `Disconnected` events arrive, not synchronously.
    pub fn disconnect_all(&self) {
        let links = self.live_links();
        for link in links {
            link.disconnect();
        }
    }

    /// Disconnects everything and waits for the live set to drain.
    pub fn shutdown(&self) {
        self.disconnect_all();

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while Instant::now() < deadline {
            if self.links.lock().unwrap().is_empty() {
                return;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        log::warn!("some links did not disconnect in time");
    }

    /// Creates a dynamic UDP link forwarding to a single host, e.g. for an
    /// external MAVLink consumer.
    pub fn create_forwarding_link(
        self: &Arc<Self>,
        name: &str,
        host: &str,
    ) -> Result<Arc<LinkHandle>> {
        let config = LinkConfig::udp(name, 0).set_dynamic(true).add_host(host);
        let config = self.add_configuration(config);
        log::debug!("new dynamic MAVLink forwarding link: {name} -> {host}");
        self.create_connected_link(&config)
    }

    /// Creates links for every auto-connect configuration.
    pub fn start_auto_connected_links(self: &Arc<Self>) {
        for config in self.configurations() {
            if !config.is_auto_connect() {
                continue;
            }
            if self.link_for_config(&config).is_some() {
                continue;
            }
            if let Err(err) = self.create_connected_link(&config) {
                log::warn!("[{}] auto-connect failed: {err}", config.name());
            }
        }
    }

    /// Persists every non-dynamic configuration.
    pub fn save_configurations(&self, path: &Path) -> Result<()> {
        settings::save_configurations(&self.configurations(), path)
    }

    /// Loads stored configurations, appending them to the tracked set.
    pub fn load_configurations(&self, path: &Path) -> Result<()> {
        for config in settings::load_configurations(path)? {
            self.add_configuration(config);
        }
        Ok(())
    }
}
