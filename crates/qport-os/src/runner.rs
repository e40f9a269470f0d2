use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qport::{Device, Result};

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Level, error, info};

use crate::store::FileStore;

const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Host settings of a [`Runner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    config_path: PathBuf,
    log_level: Level,
    tick: Duration,
}

impl RunnerConfig {
    /// Creates a [`RunnerConfig`] storing the device configuration in the
    /// given file.
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            log_level: Level::INFO,
            tick: DEFAULT_TICK,
        }
    }

    /// Sets the maximum level of the logged events.
    #[must_use]
    pub const fn log_level(mut self, log_level: Level) -> Self {
        self.log_level = log_level;
        self
    }

    /// Sets the period of the device tick.
    #[must_use]
    pub const fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Returns the configuration file.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Returns the maximum level of the logged events.
    #[must_use]
    pub const fn max_level(&self) -> Level {
        self.log_level
    }

    /// Returns the period of the device tick.
    #[must_use]
    pub const fn tick_period(&self) -> Duration {
        self.tick
    }
}

/// Drives a [`Device`] from a periodic timer.
///
/// The device is not thread-safe, so the runner must be awaited on a
/// current-thread runtime or inside a `LocalSet`.
#[derive(Debug)]
pub struct Runner {
    device: Device,
    tick: Duration,
    start: Instant,
}

impl Runner {
    /// Creates a [`Runner`], attaching a [`FileStore`] to the device.
    #[must_use]
    pub fn new(device: Device, config: &RunnerConfig) -> Self {
        Self {
            device: device.config_store(FileStore::new(config.config_path())),
            tick: config.tick_period(),
            start: Instant::now(),
        }
    }

    /// Returns the milliseconds elapsed since the runner was created.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the device.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the device, to add ports or peripherals before running.
    pub const fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Restores the stored configuration.
    ///
    /// # Errors
    ///
    /// Fails as [`Device::load`] does.
    pub fn load(&mut self) -> Result<()> {
        let now_ms = self.now_ms();
        self.device.load(now_ms)
    }

    /// Ticks the device until `shutdown` resolves, then saves the
    /// configuration and returns the device.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Device {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Device running, tick every {:?}", self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = self.now_ms();
                    self.device.tick(now_ms);
                }
                () = &mut shutdown => break,
            }
        }

        if let Err(e) = self.device.save() {
            error!("Configuration not saved on shutdown: {e}");
        }
        info!("Device stopped");
        self.device
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use qport::port::PortType;
    use qport::virtual_port::virtual_port;
    use qport::{Device, Settings};

    use super::{Runner, RunnerConfig};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("qport-{}-{name}.bin", std::process::id()))
    }

    fn device() -> Device {
        Device::new(Settings::new().save_delay(500))
    }

    #[test]
    fn test_config_builder() {
        let config = RunnerConfig::new("/var/lib/qport/config.bin")
            .log_level(tracing::Level::DEBUG)
            .tick(Duration::from_millis(20));

        assert_eq!(config.config_path().to_str(), Some("/var/lib/qport/config.bin"));
        assert_eq!(config.max_level(), tracing::Level::DEBUG);
        assert_eq!(config.tick_period(), Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_and_reload() {
        let path = temp_path("runner");
        let config = RunnerConfig::new(&path).tick(Duration::from_millis(10));

        let mut runner = Runner::new(device(), &config);
        let _ = runner
            .device_mut()
            .add_virtual_port(virtual_port("setpoint", PortType::Number))
            .unwrap();
        let now_ms = runner.now_ms();
        runner
            .device_mut()
            .write_port_value("setpoint", 21.5, now_ms)
            .unwrap();

        let stopped = runner
            .run_until(tokio::time::sleep(Duration::from_millis(1000)))
            .await;
        assert_eq!(stopped.port("setpoint").unwrap().value(), 21.5);

        let mut runner = Runner::new(device(), &config);
        runner.load().unwrap();
        assert_eq!(runner.device().port("setpoint").unwrap().value(), 21.5);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_on_shutdown() {
        let path = temp_path("shutdown");
        let config = RunnerConfig::new(&path);

        let mut runner = Runner::new(Device::new(Settings::new().save_delay(60_000)), &config);
        let _ = runner
            .device_mut()
            .add_virtual_port(virtual_port("mode", PortType::Number))
            .unwrap();
        runner.device_mut().write_port_value("mode", 2., 0).unwrap();

        let _ = runner
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        let mut runner = Runner::new(device(), &config);
        runner.load().unwrap();
        assert_eq!(runner.device().port("mode").unwrap().value(), 2.);

        std::fs::remove_file(&path).unwrap();
    }
}
