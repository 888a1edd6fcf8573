use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jack::{Client, MidiIn, Port, ProcessScope};
use log::{debug, warn};
use rtrb::{Consumer, Producer, RingBuffer};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Preallocated message slots per port; overflow drops and counts
pub const MESSAGE_RING_CAPACITY: usize = 1000;

/// How long the consumer loop sleeps between drains
const CONSUMER_SLEEP: Duration = Duration::from_millis(5);

/// An ingress port: its JACK name, the upstream port it connects from, and
/// how long messages may batch before the consumer flushes them (zero means
/// "hand over straight from the callback").
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub name: String,
    pub upstream: Option<String>,
    pub wait_time: Duration,
}

impl PortConfig {
    pub fn new(name: &str, upstream: Option<&str>, wait_time: Duration) -> Self {
        Self {
            name: name.to_string(),
            upstream: upstream.map(str::to_string),
            wait_time,
        }
    }
}

/// The standard ingress set: the main passthrough delivered immediately,
/// everything else batched on a short flush interval
pub fn default_ports(router_client: &str) -> Vec<PortConfig> {
    let upstream = |port: &str| format!("{}:{}", router_client, port);
    vec![
        PortConfig::new(
            "PassthroughIn",
            Some(upstream("Passthrough").as_str()),
            Duration::ZERO,
        ),
        PortConfig::new(
            "InternalPassthroughIn",
            Some(upstream("InternalPassthrough").as_str()),
            Duration::from_millis(5),
        ),
        PortConfig::new(
            "HardwareInPassthroughIn",
            Some(upstream("HardwareInPassthrough").as_str()),
            Duration::from_millis(5),
        ),
        PortConfig::new(
            "ExternalOutIn",
            Some(upstream("ExternalOut").as_str()),
            Duration::from_millis(5),
        ),
    ]
}

/// One timestamped message out of the intake.
///
/// Note-like messages (status `0x80..0xA0`) arrive structured; anything
/// else carries only the raw bytes with `is_note_like` unset. Timestamps
/// are in transport sub-steps.
#[derive(Debug, Clone, Copy)]
pub struct NoteMessage {
    pub port: usize,
    pub on: bool,
    pub midi_note: u8,
    pub midi_channel: u8,
    pub velocity: u8,
    pub time_stamp: f64,
    pub bytes: [u8; 3],
    pub is_note_like: bool,
}

/// Build a message from raw port bytes; system-common traffic (status
/// `0xF0` and up) and empty events yield `None`
pub fn message_from_raw(port: usize, bytes: &[u8], time_stamp: f64) -> Option<NoteMessage> {
    let &byte1 = bytes.first()?;
    if byte1 & 0xF0 == 0xF0 {
        return None;
    }
    let mut raw = [0u8; 3];
    for (slot, &byte) in raw.iter_mut().zip(bytes) {
        *slot = byte;
    }
    if (0x80..0xA0).contains(&byte1) {
        Some(NoteMessage {
            port,
            on: byte1 >= 0x90,
            midi_note: raw[1],
            midi_channel: byte1 & 0x0F,
            velocity: raw[2],
            time_stamp,
            bytes: raw,
            is_note_like: true,
        })
    } else {
        Some(NoteMessage {
            port,
            on: false,
            midi_note: 0,
            midi_channel: byte1 & 0x0F,
            velocity: 0,
            time_stamp,
            bytes: raw,
            is_note_like: false,
        })
    }
}

struct CallbackPort {
    port: Port<MidiIn>,
    producer: Producer<NoteMessage>,
    lost: Arc<AtomicU64>,
    immediate: bool,
}

struct ConsumerPort {
    name: String,
    upstream: Option<String>,
    wait_time: Duration,
    consumer: Consumer<NoteMessage>,
    lost: Arc<AtomicU64>,
    last_flush: Instant,
}

/// The audio-thread half of the intake.
///
/// Call [`process`](IntakeProcess::process) from the JACK process callback.
/// It only reads port buffers, does arithmetic and pushes into preallocated
/// rings; it never allocates, locks or blocks.
pub struct IntakeProcess {
    ports: Vec<CallbackPort>,
    transport: Arc<dyn Transport>,
    immediate_handler: Option<Box<dyn FnMut(&NoteMessage) + Send>>,
}

impl IntakeProcess {
    /// Install a handler invoked straight from the audio callback for ports
    /// with a zero wait time. The handler must itself be wait-free; without
    /// one those ports fall back to the ring like everyone else.
    pub fn set_immediate_handler(&mut self, handler: impl FnMut(&NoteMessage) + Send + 'static) {
        self.immediate_handler = Some(Box::new(handler));
    }

    pub fn process(&mut self, ps: &ProcessScope) {
        let Ok(times) = ps.cycle_times() else {
            return;
        };
        let frames = ps.n_frames().max(1) as f64;
        let micros_per_frame = (times.next_usecs.saturating_sub(times.current_usecs)) as f64 / frames;
        let sub_step_micros = self.transport.sub_step_length_micros().max(1) as f64;
        // Where the playhead actually is, one period behind the scheduled one
        let current_playhead = self.transport.sub_step_playhead() as f64
            - times.period_usecs as f64 / sub_step_micros;

        for (index, port) in self.ports.iter_mut().enumerate() {
            for event in port.port.iter(ps) {
                let time_stamp =
                    current_playhead + event.time as f64 * micros_per_frame / sub_step_micros;
                let Some(message) = message_from_raw(index, event.bytes, time_stamp) else {
                    continue;
                };
                if port.immediate {
                    if let Some(handler) = &mut self.immediate_handler {
                        handler(&message);
                        continue;
                    }
                }
                if port.producer.push(message).is_err() {
                    port.lost.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// The consumer half of the intake: drains the per-port rings on a short
/// fixed interval and hands messages to downstream consumers.
pub struct MidiIntake {
    ports: Vec<ConsumerPort>,
}

impl MidiIntake {
    /// Register the configured ingress ports on a JACK client.
    ///
    /// A port that fails to register is logged and skipped; the intake stays
    /// operational on the rest. Only a client that yields no ports at all is
    /// an error.
    pub fn open(
        client: &Client,
        configs: &[PortConfig],
        transport: Arc<dyn Transport>,
    ) -> Result<(MidiIntake, IntakeProcess)> {
        let mut callback_ports = Vec::new();
        let mut consumer_ports = Vec::new();
        let mut last_error = None;
        for config in configs {
            match client.register_port(&config.name, MidiIn::default()) {
                Ok(port) => {
                    let (producer, consumer) = RingBuffer::new(MESSAGE_RING_CAPACITY);
                    let lost = Arc::new(AtomicU64::new(0));
                    callback_ports.push(CallbackPort {
                        port,
                        producer,
                        lost: Arc::clone(&lost),
                        immediate: config.wait_time.is_zero(),
                    });
                    consumer_ports.push(ConsumerPort {
                        name: config.name.clone(),
                        upstream: config.upstream.clone(),
                        wait_time: config.wait_time,
                        consumer,
                        lost,
                        last_flush: Instant::now(),
                    });
                    debug!("registered intake port {}", config.name);
                }
                Err(error) => {
                    warn!(
                        "could not register intake port {}: {}",
                        config.name, error
                    );
                    last_error = Some(error);
                }
            }
        }
        if consumer_ports.is_empty() {
            return Err(last_error.map(Error::Jack).unwrap_or(Error::NoIntakePorts));
        }
        Ok((
            MidiIntake {
                ports: consumer_ports,
            },
            IntakeProcess {
                ports: callback_ports,
                transport,
                immediate_handler: None,
            },
        ))
    }

    /// Connect each port to its upstream source. Call once the client is
    /// activated; failures are reported but not retried.
    pub fn connect_upstream(&self, client: &Client) {
        for port in &self.ports {
            let Some(upstream) = &port.upstream else {
                continue;
            };
            let destination = format!("{}:{}", client.name(), port.name);
            match client.connect_ports_by_name(upstream, &destination) {
                Ok(()) => debug!("connected {} to {}", upstream, destination),
                Err(error) => warn!(
                    "could not connect {} to {}: {}",
                    upstream, destination, error
                ),
            }
        }
    }

    /// Drain whatever is due into the handler: immediate ports on every
    /// call, batched ports once their wait time has elapsed
    pub fn drain(&mut self, handler: &mut dyn FnMut(&NoteMessage)) {
        let now = Instant::now();
        for port in &mut self.ports {
            if !port.wait_time.is_zero() && now.duration_since(port.last_flush) < port.wait_time {
                continue;
            }
            port.last_flush = now;
            while let Ok(message) = port.consumer.pop() {
                handler(&message);
            }
        }
    }

    /// Total messages dropped to ring overflow across all ports
    pub fn lost_events(&self) -> u64 {
        self.ports
            .iter()
            .map(|port| port.lost.load(Ordering::Relaxed))
            .sum()
    }

    /// Run the consumer loop until `running` goes false, sleeping a short
    /// fixed interval between drains
    pub fn run(mut self, running: Arc<AtomicBool>, mut handler: impl FnMut(&NoteMessage) + Send) {
        while running.load(Ordering::Relaxed) {
            self.drain(&mut handler);
            thread::sleep(CONSUMER_SLEEP);
        }
    }

    /// Convenience wrapper spawning [`run`](MidiIntake::run) on its own thread
    pub fn spawn(
        self,
        running: Arc<AtomicBool>,
        handler: impl FnMut(&NoteMessage) + Send + 'static,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run(running, handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_common_messages_are_dropped() {
        assert!(message_from_raw(0, &[0xF8], 0.0).is_none());
        assert!(message_from_raw(0, &[0xF0, 1, 2], 0.0).is_none());
        assert!(message_from_raw(0, &[], 0.0).is_none());
    }

    #[test]
    fn note_messages_arrive_structured() {
        let message = message_from_raw(1, &[0x93, 64, 100], 12.5).unwrap();
        assert!(message.is_note_like);
        assert!(message.on);
        assert_eq!(message.midi_channel, 3);
        assert_eq!(message.midi_note, 64);
        assert_eq!(message.velocity, 100);
        assert_eq!(message.bytes, [0x93, 64, 100]);
        assert!((message.time_stamp - 12.5).abs() < f64::EPSILON);

        let off = message_from_raw(1, &[0x83, 64, 0], 0.0).unwrap();
        assert!(!off.on);
    }

    #[test]
    fn other_statuses_are_forwarded_raw() {
        let message = message_from_raw(0, &[0xB2, 7, 127], 0.0).unwrap();
        assert!(!message.is_note_like);
        assert_eq!(message.bytes, [0xB2, 7, 127]);
        assert_eq!(message.midi_channel, 2);
    }

    #[test]
    fn default_port_set_matches_the_router_layout() {
        let ports = default_ports("router");
        assert_eq!(ports.len(), 4);
        assert!(ports[0].wait_time.is_zero());
        assert_eq!(ports[0].upstream.as_deref(), Some("router:Passthrough"));
        assert!(ports[1..].iter().all(|p| !p.wait_time.is_zero()));
    }
}
