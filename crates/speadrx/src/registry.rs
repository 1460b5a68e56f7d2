//! Process-wide DAQ lifecycle
//!
//! A [`DaqContext`] owns the single packet receiver a process may run and
//! every named consumer bound to it. Consumers are resolved from a
//! compile-time factory table: loading is a string lookup, initialising
//! parses a JSON document, starting wires the consumer's ring and filter
//! into the receiver and spawns its thread.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, DataCallback, DiagnosticCallback, RunningConsumer};
use crate::error::{DaqError, DaqResult};
use crate::ingress::{ConsumerId, IngressConfig, IngressDiagnosticCallback, PacketIngress};
use crate::reassembly::antenna::AntennaBufferConsumer;
use crate::reassembly::beam::{BurstBeamConsumer, IntegratedBeamConsumer};
use crate::reassembly::channel::{
    BurstChannelConsumer, ContinuousChannelConsumer, IntegratedChannelConsumer,
};
use crate::reassembly::correlator::CorrelatorConsumer;
use crate::reassembly::raw::RawConsumer;
use crate::reassembly::station::{StationCallback, StationConsumer};
use crate::ring::SpscRing;
use crate::station_file::{CaptureFileConfig, StationFileWriter};

/// Resolve a consumer factory by its registered name
pub fn consumer_factory(name: &str) -> Option<Box<dyn Consumer>> {
    match name {
        "rawdata" => Some(Box::new(RawConsumer::new())),
        "burstchannel" => Some(Box::new(BurstChannelConsumer::new())),
        "continuouschannel" => Some(Box::new(ContinuousChannelConsumer::new())),
        "integratedchannel" => Some(Box::new(IntegratedChannelConsumer::new())),
        "burstbeam" => Some(Box::new(BurstBeamConsumer::new())),
        "integratedbeam" => Some(Box::new(IntegratedBeamConsumer::new())),
        "stationbeam" => Some(Box::new(StationConsumer::new())),
        "antennabuffer" => Some(Box::new(AntennaBufferConsumer::new())),
        "correlator" => Some(Box::new(CorrelatorConsumer::new())),
        _ => None,
    }
}

enum ConsumerState {
    Loaded(Box<dyn Consumer>),
    Initialised(Box<dyn Consumer>),
    Running {
        runner: RunningConsumer,
        id: Option<ConsumerId>,
    },
}

/// Owner of the receiver and the named consumer instances
#[derive(Default)]
pub struct DaqContext {
    receiver: Option<Arc<PacketIngress>>,
    consumers: HashMap<String, ConsumerState>,
}

impl DaqContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the packet receiver
    ///
    /// Idempotent: a second call on a running receiver succeeds without
    /// touching it, so port additions can follow unconditionally.
    pub fn start_receiver(&mut self, config: IngressConfig) -> DaqResult<()> {
        self.start_receiver_with_diagnostics(config, None)
    }

    /// Start the packet receiver with a rate-statistics callback
    ///
    /// The callback receives the receiver's `{frames, fps, Gb/s, lost}`
    /// figures every five seconds. Idempotent like
    /// [`start_receiver`](Self::start_receiver); on an already-running
    /// receiver the callback is ignored.
    pub fn start_receiver_with_diagnostics(
        &mut self,
        config: IngressConfig,
        diagnostic_callback: Option<IngressDiagnosticCallback>,
    ) -> DaqResult<()> {
        if self.receiver.is_some() {
            return Ok(());
        }
        self.receiver = Some(Arc::new(PacketIngress::start_with_diagnostics(
            config,
            diagnostic_callback,
        )?));
        Ok(())
    }

    /// Add a destination UDP port to the receiver allowlist
    pub fn add_receiver_port(&mut self, port: u16) -> DaqResult<()> {
        self.receiver
            .as_ref()
            .ok_or(DaqError::ReceiverUninitialised)?
            .add_port(port)
    }

    /// Stop the receiver and release its sockets
    pub fn stop_receiver(&mut self) -> DaqResult<()> {
        if let Some(receiver) = self.receiver.take() {
            receiver.stop();
        }
        Ok(())
    }

    /// The running receiver, if any
    pub fn receiver(&self) -> Option<&Arc<PacketIngress>> {
        self.receiver.as_ref()
    }

    /// Instantiate the named consumer
    pub fn load_consumer(&mut self, name: &str) -> DaqResult<()> {
        if self.consumers.contains_key(name) {
            return Err(DaqError::ConsumerAlreadyInitialised(name.to_string()));
        }
        let consumer =
            consumer_factory(name).ok_or_else(|| DaqError::UnknownConsumer(name.to_string()))?;
        self.consumers
            .insert(name.to_string(), ConsumerState::Loaded(consumer));
        info!("loaded consumer {name}");
        Ok(())
    }

    /// Configure a loaded consumer from a JSON document
    pub fn initialise_consumer(&mut self, name: &str, configuration: &str) -> DaqResult<()> {
        if self.receiver.is_none() {
            return Err(DaqError::ReceiverUninitialised);
        }
        let state = self
            .consumers
            .remove(name)
            .ok_or_else(|| DaqError::ConsumerNotInitialised(name.to_string()))?;

        let mut consumer = match state {
            ConsumerState::Loaded(consumer) => consumer,
            other => {
                self.consumers.insert(name.to_string(), other);
                return Err(DaqError::ConsumerAlreadyInitialised(name.to_string()));
            }
        };

        let config = match ConsumerConfig::from_json(configuration) {
            Ok(config) => config,
            Err(err) => {
                self.consumers
                    .insert(name.to_string(), ConsumerState::Loaded(consumer));
                return Err(err);
            }
        };
        match consumer.init(&config) {
            Ok(()) => {
                self.consumers
                    .insert(name.to_string(), ConsumerState::Initialised(consumer));
                Ok(())
            }
            Err(err) => {
                self.consumers
                    .insert(name.to_string(), ConsumerState::Loaded(consumer));
                Err(err)
            }
        }
    }

    /// Attach the callback and start the consumer thread
    pub fn start_consumer(
        &mut self,
        name: &str,
        callback: DataCallback,
        diagnostic_callback: Option<DiagnosticCallback>,
    ) -> DaqResult<()> {
        let state = self
            .consumers
            .remove(name)
            .ok_or_else(|| DaqError::ConsumerNotInitialised(name.to_string()))?;
        let mut consumer = match state {
            ConsumerState::Initialised(consumer) => consumer,
            other => {
                let failure = match &other {
                    ConsumerState::Running { .. } => {
                        DaqError::ConsumerAlreadyInitialised(name.to_string())
                    }
                    _ => DaqError::ConsumerNotInitialised(name.to_string()),
                };
                self.consumers.insert(name.to_string(), other);
                return Err(failure);
            }
        };
        consumer.set_callback(callback);
        self.spawn_consumer(name, consumer, diagnostic_callback)
    }

    /// Bind the station-beam capture pipeline
    ///
    /// Creates a station consumer wired straight into a file sink, without
    /// going through the generic callback surface.
    pub fn start_station_capture(
        &mut self,
        configuration: &str,
        file_config: CaptureFileConfig,
    ) -> DaqResult<()> {
        self.start_station_consumer(
            configuration,
            StationFileWriter::new(file_config)?.into_callback(),
        )
    }

    /// Bind a station consumer to an arbitrary buffer callback
    pub fn start_station_consumer(
        &mut self,
        configuration: &str,
        callback: StationCallback,
    ) -> DaqResult<()> {
        if self.receiver.is_none() {
            return Err(DaqError::ReceiverUninitialised);
        }
        let name = "stationbeam";
        if self.consumers.contains_key(name) {
            return Err(DaqError::ConsumerAlreadyInitialised(name.to_string()));
        }

        let mut consumer = StationConsumer::new();
        consumer.init(&ConsumerConfig::from_json(configuration)?)?;
        consumer.set_station_callback(callback);
        self.spawn_consumer(name, Box::new(consumer), None)
    }

    /// Stop a consumer, detach it from the receiver and destroy it
    pub fn stop_consumer(&mut self, name: &str) -> DaqResult<()> {
        match self.consumers.remove(name) {
            Some(ConsumerState::Running { mut runner, id }) => {
                if let (Some(receiver), Some(id)) = (self.receiver.as_ref(), id) {
                    let _ = receiver.unregister_consumer(id);
                }
                runner.stop();
                info!("stopped consumer {name}");
                Ok(())
            }
            Some(other) => {
                self.consumers.insert(name.to_string(), other);
                Err(DaqError::ConsumerNotInitialised(name.to_string()))
            }
            None => Err(DaqError::ConsumerNotInitialised(name.to_string())),
        }
    }

    /// Stop every consumer, then the receiver
    pub fn stop(&mut self) {
        let names: Vec<String> = self.consumers.keys().cloned().collect();
        for name in names {
            let _ = self.stop_consumer(&name);
        }
        let _ = self.stop_receiver();
    }

    fn spawn_consumer(
        &mut self,
        name: &str,
        consumer: Box<dyn Consumer>,
        diagnostic_callback: Option<DiagnosticCallback>,
    ) -> DaqResult<()> {
        let ring = Arc::new(SpscRing::new(consumer.ring_config()));
        let filter = consumer.packet_filter();

        let id = match self.receiver.as_ref() {
            Some(receiver) => Some(receiver.register_consumer(Arc::clone(&ring), filter)?),
            None => None,
        };

        let runner = RunningConsumer::spawn(consumer, ring, diagnostic_callback);
        self.consumers
            .insert(name.to_string(), ConsumerState::Running { runner, id });
        info!("started consumer {name}");
        Ok(())
    }
}

impl Drop for DaqContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::IngressBackend;
    use std::net::Ipv4Addr;

    fn udp_receiver_config() -> IngressConfig {
        IngressConfig {
            interface: "lo".to_string(),
            ip: Ipv4Addr::LOCALHOST,
            backend: IngressBackend::UdpSocket,
            nof_threads: 1,
            ..IngressConfig::default()
        }
    }

    const BURST_CONFIG: &str = r#"{"nof_tiles": 1, "nof_channels": 2, "nof_samples": 8,
                                   "nof_antennas": 2, "nof_pols": 2, "max_packet_size": 9000}"#;

    #[test]
    fn test_unknown_consumer_rejected() {
        let mut context = DaqContext::new();
        assert!(matches!(
            context.load_consumer("nosuchthing"),
            Err(DaqError::UnknownConsumer(_))
        ));
    }

    #[test]
    fn test_duplicate_load_rejected() {
        let mut context = DaqContext::new();
        context.load_consumer("burstchannel").unwrap();
        assert!(matches!(
            context.load_consumer("burstchannel"),
            Err(DaqError::ConsumerAlreadyInitialised(_))
        ));
    }

    #[test]
    fn test_initialise_requires_receiver() {
        let mut context = DaqContext::new();
        context.load_consumer("burstchannel").unwrap();
        assert!(matches!(
            context.initialise_consumer("burstchannel", BURST_CONFIG),
            Err(DaqError::ReceiverUninitialised)
        ));
    }

    #[test]
    fn test_initialise_rejects_bad_json() {
        let mut context = DaqContext::new();
        context.start_receiver(udp_receiver_config()).unwrap();
        context.load_consumer("burstchannel").unwrap();
        assert!(matches!(
            context.initialise_consumer("burstchannel", "not json"),
            Err(DaqError::Config(_))
        ));
        // the consumer survives a configuration error and can be retried
        context
            .initialise_consumer("burstchannel", BURST_CONFIG)
            .unwrap();
        context.stop();
    }

    #[test]
    fn test_full_lifecycle() {
        let mut context = DaqContext::new();
        context.start_receiver(udp_receiver_config()).unwrap();
        // starting twice is fine
        context.start_receiver(udp_receiver_config()).unwrap();
        context.add_receiver_port(40123).unwrap();

        context.load_consumer("burstchannel").unwrap();
        context
            .initialise_consumer("burstchannel", BURST_CONFIG)
            .unwrap();
        context
            .start_consumer("burstchannel", Box::new(|_, _, _, _| {}), None)
            .unwrap();

        // double start is reported
        assert!(matches!(
            context.start_consumer("burstchannel", Box::new(|_, _, _, _| {}), None),
            Err(DaqError::ConsumerAlreadyInitialised(_))
        ));

        context.stop_consumer("burstchannel").unwrap();
        assert!(matches!(
            context.stop_consumer("burstchannel"),
            Err(DaqError::ConsumerNotInitialised(_))
        ));
        context.stop_receiver().unwrap();
    }

    #[test]
    fn test_start_skipping_initialise_rejected() {
        let mut context = DaqContext::new();
        context.start_receiver(udp_receiver_config()).unwrap();
        context.load_consumer("rawdata").unwrap();
        assert!(matches!(
            context.start_consumer("rawdata", Box::new(|_, _, _, _| {}), None),
            Err(DaqError::ConsumerNotInitialised(_))
        ));
        context.stop();
    }
}
