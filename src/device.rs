//! Typed operations on a Neptun Smart controller.

use crate::connection::{Connection, Error};
use crate::registers::{
    Config, Register, WiredSensorsStatus, WirelessSensorStatus, WirelessSensorsCount,
};
use crate::transport::{Connector, TcpConnector};
use tracing::{debug, trace, warn};

/// Wireless sensors are addressed with an 8-bit index.
pub const MAX_WIRELESS_SENSORS: u16 = u8::MAX as u16 + 1;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValveGroup {
    First,
    Second,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub config: Config,
    pub wired_sensors: WiredSensorsStatus,
    pub wireless_sensors: Vec<WirelessSensorStatus>,
}

pub struct NeptunSmart<C: Connector = TcpConnector> {
    connection: Connection<C>,
}

impl<C: Connector> NeptunSmart<C> {
    pub fn new(connection: Connection<C>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection<C> {
        &self.connection
    }

    pub async fn fetch_config(&self) -> Result<Config, Error> {
        let word = self.connection.read_register(Register::Config.address()).await?;
        if word & !Config::MASK != 0 {
            trace!(message = "ignoring undocumented config bits", bits = word & !Config::MASK);
        }
        Ok(Config::from_word(word))
    }

    pub async fn fetch_wired_sensors_status(&self) -> Result<WiredSensorsStatus, Error> {
        let word = self.connection.read_register(Register::WiredSensorsStatus.address()).await?;
        if word & !WiredSensorsStatus::MASK != 0 {
            trace!(
                message = "ignoring undocumented wired sensor bits",
                bits = word & !WiredSensorsStatus::MASK
            );
        }
        Ok(WiredSensorsStatus::from_word(word))
    }

    pub async fn fetch_wireless_sensors_count(&self) -> Result<WirelessSensorsCount, Error> {
        let word = self.connection.read_register(Register::WirelessSensorsCount.address()).await?;
        Ok(WirelessSensorsCount::from_word(word))
    }

    pub async fn fetch_wireless_sensor_status(
        &self,
        index: u8,
    ) -> Result<WirelessSensorStatus, Error> {
        let address = Register::WirelessSensorStatus(index).address();
        let word = self.connection.read_register(address).await?;
        Ok(WirelessSensorStatus::from_word(word))
    }

    /// Write the configuration register.
    ///
    /// The returned configuration is decoded from what the device acknowledged storing.
    pub async fn write_config_register(&self, config: Config) -> Result<Config, Error> {
        let word = config.to_word();
        let address = Register::Config.address();
        let stored = self.connection.write_register_verified(address, word).await?;
        Ok(Config::from_word(stored))
    }

    /// Read everything the controller reports, one request at a time.
    ///
    /// Fails as a whole if any of the reads fail, so callers never see a partially updated view.
    pub async fn fetch_snapshot(&self) -> Result<DeviceSnapshot, Error> {
        let config = self.fetch_config().await?;
        let wired_sensors = self.fetch_wired_sensors_status().await?;
        let WirelessSensorsCount { count } = self.fetch_wireless_sensors_count().await?;
        if count > MAX_WIRELESS_SENSORS {
            warn!(count, "device reports more wireless sensors than can be addressed");
        }
        let count = count.min(MAX_WIRELESS_SENSORS);
        let mut wireless_sensors = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            // `count` is clamped to the addressable range above.
            let status = self.fetch_wireless_sensor_status(index as u8).await?;
            debug!(index, ?status, "read wireless sensor");
            wireless_sensors.push(status);
        }
        Ok(DeviceSnapshot { config, wired_sensors, wireless_sensors })
    }

    /// Open or close the valves of a group.
    ///
    /// With groups disabled the controller drives all valves together, so both valve flags are
    /// set regardless of `group`.
    pub async fn set_valves(
        &self,
        group: ValveGroup,
        open: bool,
        groups_enabled: bool,
    ) -> Result<Config, Error> {
        let current = self.fetch_config().await?;
        let requested = with_valves(current, group, open, groups_enabled);
        debug!(%group, open, ?requested, "updating valves");
        self.write_config_register(requested).await
    }
}

pub fn with_valves(
    mut config: Config,
    group: ValveGroup,
    open: bool,
    groups_enabled: bool,
) -> Config {
    match (group, groups_enabled) {
        (ValveGroup::First, true) => config.valve_open_first_group = open,
        (ValveGroup::Second, true) => config.valve_open_second_group = open,
        (_, false) => {
            config.valve_open_first_group = open;
            config.valve_open_second_group = open;
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{FakeConnector, FakeDevice, connect_fake};
    use crate::failure::Classification;
    use crate::transport::TransportError;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    async fn connected(device: &Arc<FakeDevice>) -> NeptunSmart<FakeConnector> {
        let (connection, _) = connect_fake(device);
        connection.wait_connected().await;
        NeptunSmart::new(connection)
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_and_writes_config() {
        let device = FakeDevice::with_registers(&[(0, 0x0100)]);
        let neptun = connected(&device).await;

        let config = neptun.fetch_config().await.unwrap();
        assert_eq!(config, Config { valve_open_first_group: true, ..Config::default() });

        let requested = Config { valve_open_second_group: true, ..config };
        assert_eq!(requested.to_word(), 0x0300);
        let stored = neptun.write_config_register(requested).await.unwrap();
        assert!(stored.valve_open_first_group);
        assert!(stored.valve_open_second_group);
        assert!(!stored.groups_enabled);
        assert_eq!(device.register(0), Some(0x0300));
    }

    #[tokio::test(start_paused = true)]
    async fn undocumented_bits_are_ignored() {
        let device = FakeDevice::with_registers(&[(0, 0xE100), (3, 0xFFF4)]);
        let neptun = connected(&device).await;
        let config = neptun.fetch_config().await.unwrap();
        assert_eq!(config, Config { valve_open_first_group: true, ..Config::default() });
        let wired = neptun.fetch_wired_sensors_status().await.unwrap();
        assert!(wired.alarm_detected_line_three);
        assert_eq!(wired.to_word(), 0b0100);
    }

    #[tokio::test(start_paused = true)]
    async fn config_write_reports_mismatch() {
        let device = FakeDevice::with_registers(&[(0, 0x0100)]);
        *device.acknowledge_with.lock().unwrap() = Some(0x0100);
        let neptun = connected(&device).await;
        let error = neptun.set_valves(ValveGroup::First, false, true).await.unwrap_err();
        assert!(matches!(
            error,
            Error::WriteMismatch { address: 0, requested: 0x0000, acknowledged: 0x0100 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_sensors() {
        let device =
            FakeDevice::with_registers(&[(3, 0b0001), (6, 2), (57, 0x6400), (58, 0x1305)]);
        let neptun = connected(&device).await;

        let wired = neptun.fetch_wired_sensors_status().await.unwrap();
        assert!(wired.alarm_detected_line_one);
        assert_eq!(neptun.fetch_wireless_sensors_count().await.unwrap().count, 2);
        let second = neptun.fetch_wireless_sensor_status(1).await.unwrap();
        assert!(second.alarm_detected && second.connection_lost);
        assert_eq!(second.battery_level, 19);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reads_every_paired_sensor() {
        let device = FakeDevice::with_registers(&[
            (0, 0x0300),
            (3, 0),
            (6, 2),
            (57, 0x6400),
            (58, 0x1305),
        ]);
        let neptun = connected(&device).await;
        let snapshot = neptun.fetch_snapshot().await.unwrap();
        assert!(snapshot.config.valve_open_second_group);
        assert_eq!(snapshot.wired_sensors, WiredSensorsStatus::default());
        assert_eq!(
            snapshot.wireless_sensors,
            [WirelessSensorStatus::from_word(0x6400), WirelessSensorStatus::from_word(0x1305)]
        );
        assert_eq!(device.requests.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_fails_as_a_whole() {
        let device = FakeDevice::with_registers(&[(0, 0), (3, 0), (6, 1), (57, 0)]);
        let neptun = connected(&device).await;
        device.fail_next(TransportError::Timeout(crate::transport::REQUEST_TIMEOUT));
        let error = neptun.fetch_snapshot().await.unwrap_err();
        assert_eq!(error.classification(), Classification::Transient);
    }

    #[test]
    fn valve_groups() {
        let closed = Config { groups_enabled: true, ..Config::default() };
        let first = with_valves(closed, ValveGroup::First, true, true);
        assert!(first.valve_open_first_group && !first.valve_open_second_group);
        let second = with_valves(closed, ValveGroup::Second, true, true);
        assert!(!second.valve_open_first_group && second.valve_open_second_group);

        let both = with_valves(Config::default(), ValveGroup::Second, true, false);
        assert!(both.valve_open_first_group && both.valve_open_second_group);
        let none = with_valves(both, ValveGroup::First, false, false);
        assert_eq!(none, Config::default());
    }
}
