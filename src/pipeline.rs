//! MAVLink frame pipeline.
//!
//! Bytes received by a link are fed, in strict arrival order, through that
//! link's parser channel. Every complete frame is routed by its ingress leg:
//! frames from the autopilot serial link go to the currently elected UDP leg,
//! frames from a UDP leg go to the autopilot serial link. After routing, each
//! frame is published to subscribers; the bridge is the principal one.
//!
//! Framing errors are dropped silently and never disconnect a link.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;

use mavio::protocol::{MaybeVersioned, Versionless};
use mavio::{Frame, Receiver, Sender};

use crate::bridge::Bridge;
use crate::errors::{Error, Result};
use crate::link::{LinkEvent, LinkHandle, LinkKind, LinkRegistry};
use crate::utils::{mpmc, Closable};

/// A frame parsed from a link, published after routing.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    /// Link the frame arrived on.
    pub link: Arc<LinkHandle>,
    pub frame: Frame<Versionless>,
}

/// Owns no state beyond its wiring: registry for the autopilot lookup,
/// bridge for the elected UDP leg, and the frame-event bus.
pub struct Pipeline {
    registry: Arc<LinkRegistry>,
    bridge: Arc<Bridge>,
    events: mpmc::Sender<FrameEvent>,
}

impl Pipeline {
    /// Creates the pipeline and registers it with the registry so that newly
    /// created links get a decoder attached.
    pub fn new(registry: &Arc<LinkRegistry>, bridge: &Arc<Bridge>) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            registry: registry.clone(),
            bridge: bridge.clone(),
            events: mpmc::Sender::new(),
        });
        registry.set_pipeline(&pipeline);
        pipeline
    }

    /// Subscribes to parsed frames. Frames are published in strict parse
    /// order per link; no order is guaranteed across links.
    pub fn frame_events(&self) -> mpmc::Receiver<FrameEvent> {
        self.events.subscribe()
    }

    /// Spawns the decoder task for a link. Called by the registry once the
    /// link holds a freshly allocated parser channel, which is what resets
    /// the channel's parser state.
    pub(crate) fn attach(self: &Arc<Self>, link: &Arc<LinkHandle>) {
        let pipeline = self.clone();
        let link = link.clone();
        let events = link.events();

        thread::spawn(move || {
            log::trace!(
                "[{}] decoder started on channel {}",
                link.config().name(),
                link.channel()
            );
            pipeline.decode_loop(&link, events);
            log::trace!("[{}] decoder stopped", link.config().name());
        });
    }

    fn decode_loop(&self, link: &Arc<LinkHandle>, events: mpmc::Receiver<LinkEvent>) {
        let stream = LinkByteStream::new(events, link.closed_state());
        let mut receiver: Receiver<_, Versionless> = Receiver::new(stream);

        loop {
            let frame = match receiver.recv() {
                Ok(frame) => frame,
                Err(err) => match Error::from(err) {
                    Error::Io(err) => match err.kind() {
                        io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted => continue,
                        _ => return,
                    },
                    // Framing noise; the parser resynchronizes on the next
                    // frame marker.
                    _ => continue,
                },
            };

            self.route(link, frame);
        }
    }

    /// Routes a parsed frame by its ingress leg, then publishes it.
    pub(crate) fn route(&self, link: &Arc<LinkHandle>, frame: Frame<Versionless>) {
        match link.config().kind() {
            LinkKind::Serial(_) => {
                if let Some(primary) = self.bridge.primary() {
                    self.forward(&primary, &frame);
                }
            }
            LinkKind::Udp(_) => {
                if let Some(autopilot) = self.registry.autopilot_link() {
                    self.forward(&autopilot, &frame);
                }
            }
        }

        let _ = self.events.send(FrameEvent {
            link: link.clone(),
            frame,
        });
    }

    fn forward(&self, target: &Arc<LinkHandle>, frame: &Frame<Versionless>) {
        let bytes = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("failed to serialize frame for forwarding: {err}");
                return;
            }
        };

        if let Err(err) = target.write_bytes(&bytes) {
            log::debug!(
                "[{}] could not forward frame: {err}",
                target.config().name()
            );
        }
    }
}

/// Serializes a frame into its wire form.
pub(crate) fn encode_frame<V: MaybeVersioned>(frame: &Frame<V>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(crate::consts::MAX_FRAME_SIZE);
    let mut sender = Sender::new(&mut buf);
    sender.send(frame)?;
    drop(sender);
    Ok(buf)
}

/// Adapter that turns a link's `BytesReceived` events into a byte stream the
/// codec can read from. Ends with `ConnectionAborted` once the link
/// disconnects, tears down, or its worker goes away.
struct LinkByteStream {
    events: mpmc::Receiver<LinkEvent>,
    state: Closable,
    buf: Vec<u8>,
}

impl LinkByteStream {
    fn new(events: mpmc::Receiver<LinkEvent>, state: Closable) -> Self {
        Self {
            events,
            state,
            buf: Vec::new(),
        }
    }
}

impl Read for LinkByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buf.is_empty() {
            match self.events.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(LinkEvent::BytesReceived(data)) => self.buf.extend_from_slice(&data),
                Ok(LinkEvent::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "link disconnected",
                    ))
                }
                Ok(_) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if self.state.is_closed() {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "link torn down",
                        ));
                    }
                }
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, err));
                }
            }
        }

        let n = self.buf.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::UdpSocket;
    use std::time::Duration;

    use mavio::protocol::V2;

    use crate::bridge::{heartbeat_message, BridgeConfig};
    use crate::link::LinkConfig;

    fn heartbeat_frame(sequence: u8) -> Frame<V2> {
        Frame::builder()
            .sequence(sequence)
            .system_id(1)
            .component_id(2)
            .version(V2)
            .message(&heartbeat_message())
            .unwrap()
            .build()
    }

    fn versionless(frame: &Frame<V2>) -> Frame<Versionless> {
        let bytes = encode_frame(frame).unwrap();
        let mut receiver: Receiver<_, Versionless> = Receiver::new(bytes.as_slice());
        receiver.recv().unwrap()
    }

    fn recv_datagram(socket: &UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 512];
        socket
            .recv_from(&mut buf)
            .ok()
            .map(|(n, _)| buf[..n].to_vec())
    }

    #[test]
    fn concatenated_frames_parse_in_order() {
        let frames: Vec<_> = (0..3).map(heartbeat_frame).collect();
        let mut bytes = Vec::new();
        for frame in &frames {
            bytes.extend(encode_frame(frame).unwrap());
        }

        let (tx, rx) = mpmc::channel();
        tx.send(LinkEvent::BytesReceived(bytes)).unwrap();
        tx.send(LinkEvent::Disconnected).unwrap();

        let state = crate::utils::Closer::new();
        let stream = LinkByteStream::new(rx, state.to_closable());
        let mut receiver: Receiver<_, Versionless> = Receiver::new(stream);

        for expected in &frames {
            let parsed = receiver.recv().unwrap();
            assert_eq!(
                encode_frame(&parsed).unwrap(),
                encode_frame(expected).unwrap()
            );
        }
        assert!(receiver.recv().is_err());
    }

    #[test]
    fn byte_stream_skips_interleaved_events() {
        let frame = heartbeat_frame(0);
        let bytes = encode_frame(&frame).unwrap();
        let split = bytes.len() / 2;

        let (tx, rx) = mpmc::channel();
        tx.send(LinkEvent::BytesReceived(bytes[..split].to_vec()))
            .unwrap();
        tx.send(LinkEvent::BytesSent(vec![1, 2, 3])).unwrap();
        tx.send(LinkEvent::BytesReceived(bytes[split..].to_vec()))
            .unwrap();

        let state = crate::utils::Closer::new();
        let stream = LinkByteStream::new(rx, state.to_closable());
        let mut receiver: Receiver<_, Versionless> = Receiver::new(stream);
        let parsed = receiver.recv().unwrap();
        assert_eq!(encode_frame(&parsed).unwrap(), bytes);
    }

    #[test]
    fn serial_origin_frames_go_to_the_elected_leg_only() {
        let primary_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let secondary_rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        primary_rx
            .set_read_timeout(Some(Duration::from_millis(1000)))
            .unwrap();
        secondary_rx
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let registry = LinkRegistry::new();
        let bridge = Bridge::new(BridgeConfig::default());
        let pipeline = Pipeline::new(&registry, &bridge);

        let primary_cfg = registry.add_configuration(
            LinkConfig::udp(
                crate::consts::PRIMARY_UDP_LINK_NAME,
                portpicker::pick_unused_port().unwrap(),
            )
            .add_host(&primary_rx.local_addr().unwrap().to_string()),
        );
        let secondary_cfg = registry.add_configuration(
            LinkConfig::udp(
                crate::consts::SECONDARY_UDP_LINK_NAME,
                portpicker::pick_unused_port().unwrap(),
            )
            .add_host(&secondary_rx.local_addr().unwrap().to_string()),
        );

        let primary = registry.create_connected_link(&primary_cfg).unwrap();
        let secondary = registry.create_connected_link(&secondary_cfg).unwrap();
        bridge.set_udp_legs(&primary, &secondary);

        // An unconnected serial handle is enough to mark the ingress leg.
        let serial = crate::link::handle::LinkHandle::start(Arc::new(LinkConfig::serial(
            "Autopilot",
            "/dev/ttyACM7",
            115_200,
        )));

        let frame = versionless(&heartbeat_frame(42));
        pipeline.route(&serial, frame.clone());

        let delivered = recv_datagram(&primary_rx).expect("primary peer must receive the frame");
        assert_eq!(delivered, encode_frame(&frame).unwrap());
        assert!(
            recv_datagram(&secondary_rx).is_none(),
            "secondary peer must stay silent"
        );

        registry.shutdown();
    }

    #[test]
    fn routed_frames_are_published_to_subscribers() {
        let registry = LinkRegistry::new();
        let bridge = Bridge::new(BridgeConfig::default());
        let pipeline = Pipeline::new(&registry, &bridge);
        let events = pipeline.frame_events();

        let udp = crate::link::handle::LinkHandle::start(Arc::new(LinkConfig::udp(
            "Quiet UDP",
            portpicker::pick_unused_port().unwrap(),
        )));

        let frame = versionless(&heartbeat_frame(7));
        pipeline.route(&udp, frame.clone());

        let event = events.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(Arc::ptr_eq(&event.link, &udp));
        assert_eq!(
            encode_frame(&event.frame).unwrap(),
            encode_frame(&frame).unwrap()
        );
    }
}
