//! Acquisition orchestration on top of the driver seam
//!
//! Ties one [`DeviceHandle`] to one [`DecodeEngine`]: configure the board
//! from the parameter map, derive the time step from the ADC sample rate,
//! arm and start acquisition, and run a read thread that polls the driver
//! and feeds the engine. Gen-1 boards in software start mode defer the arm
//! command to the start phase; gen-2 boards arm immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::common::EventData;
use crate::config::ParameterMap;
use crate::decoder::Generation;
use crate::driver::{paths, DeviceHandle, DriverError};
use crate::engine::{DecodeEngine, EngineStatsSnapshot};
use crate::factory::{self, FirmwareType};

/// Fallback read-buffer size when the board does not report
/// `/par/MaxRawDataSize`
const DEFAULT_MAX_RAW_DATA_SIZE: usize = 1024 * 1024;

/// Driver poll timeout per read call
const READ_TIMEOUT_MS: i32 = 100;

/// Gen-1 start mode requiring the arm command at start time
const START_MODE_SW: &str = "START_MODE_SW";

/// One digitizer under acquisition control
pub struct Digitizer<H: DeviceHandle + Sync + 'static> {
    handle: Arc<H>,
    engine: Arc<DecodeEngine>,
    firmware: FirmwareType,
    max_raw_data_size: usize,
    armed: bool,
    acquiring: bool,
    shutdown: Arc<AtomicBool>,
    read_thread: Option<JoinHandle<()>>,
}

impl<H: DeviceHandle + Sync + 'static> Digitizer<H> {
    /// Create a digitizer over an already-opened device handle.
    ///
    /// The firmware type is resolved from the parameter map where
    /// possible, otherwise from the device tree; unresolved devices fall
    /// back to PSD2 inside the factory.
    pub fn new(handle: H, params: &ParameterMap) -> Result<Self, DriverError> {
        let firmware = match factory::detect_firmware(params) {
            Some(fw) => fw,
            None => {
                let tree = handle.device_tree()?;
                match FirmwareType::from_device_tree(&tree) {
                    Some(fw) => fw,
                    None => {
                        warn!("device tree analysis inconclusive, defaulting to PSD2");
                        FirmwareType::Psd2
                    }
                }
            }
        };
        info!(?firmware, "digitizer firmware resolved");

        let engine = factory::build_engine_for(firmware, params);

        Ok(Self {
            handle: Arc::new(handle),
            engine: Arc::new(engine),
            firmware,
            max_raw_data_size: DEFAULT_MAX_RAW_DATA_SIZE,
            armed: false,
            acquiring: false,
            shutdown: Arc::new(AtomicBool::new(false)),
            read_thread: None,
        })
    }

    pub fn firmware(&self) -> FirmwareType {
        self.firmware
    }

    /// Reset the board, apply `/`-prefixed parameters, and derive the
    /// time step and read-buffer size from board parameters
    pub fn configure(&mut self, params: &ParameterMap) -> Result<(), DriverError> {
        self.handle.send_command(paths::CMD_RESET)?;

        let mut applied = 0usize;
        for (path, value) in params.driver_parameters() {
            self.handle.set_parameter(path, value)?;
            applied += 1;
        }
        info!(applied, "device parameters applied");

        match self.handle.get_parameter(paths::PAR_MAX_RAW_DATA_SIZE) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.max_raw_data_size = size,
                _ => warn!(%value, "unusable MaxRawDataSize, keeping default"),
            },
            Err(err) => warn!(%err, "MaxRawDataSize unavailable, keeping default"),
        }
        info!(max_raw_data_size = self.max_raw_data_size, "read buffer sized");

        let rate = self.handle.get_parameter(paths::PAR_ADC_SAMPLE_RATE)?;
        let rate_mhz: u32 = rate.trim().parse().map_err(|_| {
            DriverError::parameter(paths::PAR_ADC_SAMPLE_RATE, format!("not a number: {rate}"))
        })?;
        if rate_mhz == 0 {
            return Err(DriverError::parameter(
                paths::PAR_ADC_SAMPLE_RATE,
                "sample rate is zero",
            ));
        }
        let time_step_ns = 1000 / rate_mhz;
        self.engine.set_time_step(time_step_ns);
        info!(rate_mhz, time_step_ns, "time step configured");

        Ok(())
    }

    /// Arm the acquisition.
    ///
    /// Gen-1 boards in software start mode are armed by the start command
    /// itself, so arming is deferred there.
    pub fn arm(&mut self) -> Result<(), DriverError> {
        if self.armed {
            return Ok(());
        }
        if self.firmware.generation() == Generation::Dig1 {
            let start_mode = self
                .handle
                .get_parameter(paths::PAR_START_MODE)
                .unwrap_or_default();
            if start_mode == START_MODE_SW {
                info!("software start mode, deferring arm to start");
                self.armed = true;
                return Ok(());
            }
        }
        self.handle.send_command(paths::CMD_ARM_ACQUISITION)?;
        self.armed = true;
        Ok(())
    }

    /// Start acquisition: spawn the read thread and issue the start command
    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.acquiring {
            return Ok(());
        }
        if !self.armed {
            self.arm()?;
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let handle = Arc::clone(&self.handle);
        let engine = Arc::clone(&self.engine);
        let shutdown = Arc::clone(&self.shutdown);
        let max_size = self.max_raw_data_size;

        self.read_thread = Some(
            thread::Builder::new()
                .name("digitizer-read".to_string())
                .spawn(move || read_loop(handle, engine, shutdown, max_size))
                .expect("failed to spawn read thread"),
        );

        match self.firmware.generation() {
            Generation::Dig1 => {
                let start_mode = self
                    .handle
                    .get_parameter(paths::PAR_START_MODE)
                    .unwrap_or_default();
                if start_mode == START_MODE_SW {
                    info!("starting acquisition (software start mode)");
                    self.handle.send_command(paths::CMD_ARM_ACQUISITION)?;
                } else {
                    info!("acquisition already started on arm");
                }
            }
            Generation::Dig2 => {
                info!("starting acquisition");
                self.handle.send_command(paths::CMD_SW_START_ACQUISITION)?;
            }
        }

        self.acquiring = true;
        Ok(())
    }

    /// Stop acquisition, disarm and join the read thread
    pub fn stop(&mut self) -> Result<(), DriverError> {
        if !self.acquiring {
            return Ok(());
        }

        let stop_result = self.handle.send_command(paths::CMD_SW_STOP_ACQUISITION);
        let disarm_result = self.handle.send_command(paths::CMD_DISARM_ACQUISITION);

        // Let the read thread pick up the trailing buffers (gen-2 ends the
        // run with a Stop frame) before signalling it down
        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            match self.handle.has_data(10) {
                Ok(true) => thread::sleep(Duration::from_millis(1)),
                _ => break,
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(read_thread) = self.read_thread.take() {
            let _ = read_thread.join();
        }
        self.acquiring = false;
        self.armed = false;

        stop_result?;
        disarm_result
    }

    /// Issue a software trigger
    pub fn send_sw_trigger(&self) -> Result<(), DriverError> {
        self.handle.send_command(paths::CMD_SEND_SW_TRIGGER)
    }

    /// Take the events decoded since the last call
    pub fn events(&self) -> Vec<EventData> {
        self.engine.drain()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.engine.stats()
    }

    /// Shared access to the underlying engine, for direct `submit` paths
    pub fn engine(&self) -> &DecodeEngine {
        &self.engine
    }
}

impl<H: DeviceHandle + Sync + 'static> Drop for Digitizer<H> {
    fn drop(&mut self) {
        if self.acquiring {
            let _ = self.stop();
        }
    }
}

/// Poll the driver and feed the engine until shutdown.
///
/// Timeouts are idle time, not failures; read errors are logged and the
/// loop continues, except for a lost device which ends the run.
fn read_loop<H: DeviceHandle>(
    handle: Arc<H>,
    engine: Arc<DecodeEngine>,
    shutdown: Arc<AtomicBool>,
    max_size: usize,
) {
    info!("read loop started");
    while !shutdown.load(Ordering::SeqCst) {
        match handle.read_data(READ_TIMEOUT_MS, max_size) {
            Ok(Some(raw)) => {
                engine.submit(raw);
            }
            Ok(None) => {
                // Timeout, nothing to read yet
                thread::sleep(Duration::from_millis(1));
            }
            Err(DriverError::NotReachable(reason)) => {
                error!(%reason, "device lost, stopping read loop");
                break;
            }
            Err(err) => {
                error!(%err, "read error");
            }
        }
    }
    info!("read loop stopped");
}
