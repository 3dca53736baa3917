//! The periodic polling loop feeding the accounting engine.

use crate::config::BridgeConfig;
use crate::core::accounting::{AccountingEngine, Mode};
use crate::protocols::GuardedClient;
use crate::BridgeResult;
use std::sync::Arc;
use std::time::Duration;

/// Holding-register layout per heat-pump device.
///
/// Device `n` (0-based) occupies the block `base + 100 * n`; the fields are
/// offsets inside that block. The accumulated compressor power is a
/// two-register value in Wh.
#[derive(Debug, Clone)]
pub struct RegisterMap {
    pub base: u16,
    pub block_stride: u16,
    pub operating_state: u16,
    pub power_accumulated: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            base: 1000,
            block_stride: 100,
            operating_state: 3,
            power_accumulated: 20,
        }
    }
}

impl RegisterMap {
    pub fn operating_state_addr(&self, device: u32) -> u16 {
        self.base + self.block_stride * device as u16 + self.operating_state
    }

    pub fn power_accumulated_addr(&self, device: u32) -> u16 {
        self.base + self.block_stride * device as u16 + self.power_accumulated
    }
}

/// One published poll result.
#[derive(Debug, Clone)]
pub struct PollReading {
    pub device: u32,
    pub mode: Mode,
    pub accumulator_kwh: f64,
    pub delta_kwh: f64,
    /// Display name of the state sensor, honoring user overrides.
    pub state_sensor_name: String,
}

/// Polls each device and feeds the accounting engine.
pub struct Poller {
    client: Arc<GuardedClient>,
    engine: AccountingEngine,
    config: BridgeConfig,
    map: RegisterMap,
    devices: Vec<u32>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        client: Arc<GuardedClient>,
        engine: AccountingEngine,
        config: BridgeConfig,
        map: RegisterMap,
        devices: Vec<u32>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            engine,
            config,
            map,
            devices,
            interval,
        }
    }

    /// Poll every device once. A failing device is logged and skipped so one
    /// fault never starves the remaining devices of their cycle.
    pub async fn poll_once(&self) -> Vec<PollReading> {
        let mut readings = Vec::new();
        for device in &self.devices {
            match self.poll_device(*device).await {
                Ok(Some(reading)) => readings.push(reading),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(device = *device, error = %e, "Device poll failed");
                }
            }
        }
        readings
    }

    async fn poll_device(&self, device: u32) -> BridgeResult<Option<PollReading>> {
        let state_addr = self.map.operating_state_addr(device);
        let power_addr = self.map.power_accumulated_addr(device);
        if self.config.is_register_disabled(u32::from(state_addr))
            || self.config.is_register_disabled(u32::from(power_addr))
        {
            tracing::debug!(device, "Device registers disabled, skipping poll");
            return Ok(None);
        }

        let raw_state = self
            .client
            .read_registers(state_addr, 1)
            .await?
            .first()
            .copied()
            .unwrap_or(0);
        let mode = Mode::from_raw(raw_state);

        let accumulated_wh = self.client.read_int32(power_addr).await?;
        let accumulator_kwh = f64::from(accumulated_wh) / 1000.0;

        let outcome = self.engine.observe(device, accumulator_kwh, mode)?;

        let sensor_id = format!("hp{}_operating_state", device + 1);
        let state_sensor_name = self
            .config
            .name_override(&sensor_id)
            .unwrap_or(&sensor_id)
            .to_string();

        Ok(Some(PollReading {
            device,
            mode,
            accumulator_kwh,
            delta_kwh: outcome.delta_kwh,
            state_sensor_name,
        }))
    }

    /// Run the polling loop until the task is cancelled.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for reading in self.poll_once().await {
                tracing::debug!(
                    device = reading.device,
                    mode = %reading.mode,
                    accumulator_kwh = reading.accumulator_kwh,
                    "Poll complete"
                );
            }
        }
    }
}
