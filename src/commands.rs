use crate::device::DeviceSnapshot;
use crate::registers::WirelessSensorStatus;

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

/// How the accessory side sees a wireless sensor.
#[derive(serde::Serialize)]
pub struct WirelessSensorRecord {
    pub leak_detected: bool,
    pub fault: bool,
    pub battery_level: u8,
    pub battery_low: bool,
}

impl From<&WirelessSensorStatus> for WirelessSensorRecord {
    fn from(status: &WirelessSensorStatus) -> Self {
        Self {
            leak_detected: status.alarm_detected,
            fault: status.connection_lost,
            battery_level: status.battery_level,
            battery_low: status.is_battery_low(),
        }
    }
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

/// Table rows describing a snapshot, limited to the first `wired_lines` wired sensor lines.
fn snapshot_rows(snapshot: &DeviceSnapshot, wired_lines: usize) -> Vec<Vec<String>> {
    let config = &snapshot.config;
    let mut rows = vec![
        vec!["Valves group 1 open".into(), yes_no(config.valve_open_first_group)],
        vec!["Valves group 2 open".into(), yes_no(config.valve_open_second_group)],
        vec!["Groups enabled".into(), yes_no(config.groups_enabled)],
        vec!["Alarm group 1".into(), yes_no(config.alarm_first_group)],
        vec!["Alarm group 2".into(), yes_no(config.alarm_second_group)],
        vec!["Floor wash mode".into(), yes_no(config.floor_wash_mode)],
        vec!["Pairing mode".into(), yes_no(config.pairing_mode_active)],
        vec!["Keyboard locked".into(), yes_no(config.keyboard_locked)],
    ];
    for line in 0..wired_lines {
        if let Some(alarm) = snapshot.wired_sensors.line(line) {
            rows.push(vec![format!("Wired sensor {} leak", line + 1), yes_no(alarm)]);
        }
    }
    for (index, status) in snapshot.wireless_sensors.iter().enumerate() {
        let record = WirelessSensorRecord::from(status);
        rows.push(vec![
            format!("Wireless sensor {}", index + 1),
            format!(
                "leak: {}, lost connection: {}, battery: {}%{}",
                yes_no(record.leak_detected),
                yes_no(record.fault),
                record.battery_level,
                if record.battery_low { " (low)" } else { "" },
            ),
        ]);
    }
    rows
}

pub mod registers {
    use crate::output;
    use crate::registers::{REGISTERS, RegisterSchema};

    /// Search and output the known modbus registers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    fn is_match(register: &RegisterSchema, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        register.name.contains(&pattern)
            || register.description.to_uppercase().contains(&pattern)
            || register.address.contains(&pattern)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Address", "Name", "Mode", "Description"]);
        for register in &REGISTERS {
            if let Some(pattern) = &args.filter {
                if !is_match(register, pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![vec![
                            register.address.to_string(),
                            register.name.to_string(),
                            register.mode.to_string(),
                            register.description.to_string(),
                        ]]
                    },
                    || register,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod read {
    use crate::connection::{self, Connection};
    use crate::device::{DeviceSnapshot, NeptunSmart};
    use crate::output;
    use crate::transport::Endpoint;

    /// Connect to the controller and print everything it reports.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Give up if no connection is established within this time.
        #[arg(long, default_value = "15s")]
        connect_timeout: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to {0} within {1}")]
        ConnectTimeout(Endpoint, humantime::Duration),
        #[error("could not read the device state")]
        Read(#[source] connection::Error),
        #[error("could not output the device state")]
        Output(#[source] output::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let snapshot = runtime.block_on(fetch(&args.connection, args.connect_timeout))?;
        output.table_headers(vec!["Property", "Value"]);
        output
            .result(|| super::snapshot_rows(&snapshot, 4), || &snapshot)
            .map_err(Error::Output)?;
        output.commit().map_err(Error::Output)
    }

    async fn fetch(
        connection: &connection::Args,
        connect_timeout: humantime::Duration,
    ) -> Result<DeviceSnapshot, Error> {
        let endpoint = connection.endpoint();
        let neptun = NeptunSmart::new(Connection::new(endpoint.clone(), || {}));
        tokio::time::timeout(*connect_timeout, neptun.connection().wait_connected())
            .await
            .map_err(|_| Error::ConnectTimeout(endpoint, connect_timeout))?;
        neptun.fetch_snapshot().await.map_err(Error::Read)
    }
}

pub mod valve {
    use crate::connection::{self, Connection};
    use crate::device::{NeptunSmart, ValveGroup};
    use crate::transport::Endpoint;
    use tracing::info;

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum State {
        Open,
        Close,
    }

    /// Open or close the valves.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(value_enum)]
        state: State,
        /// The valve group to switch. Ignored unless `--groups-enabled` is given.
        #[arg(long, value_enum, default_value_t = ValveGroup::First)]
        group: ValveGroup,
        /// The controller drives its two valve groups independently.
        #[arg(long)]
        groups_enabled: bool,
        /// Give up if no connection is established within this time.
        #[arg(long, default_value = "15s")]
        connect_timeout: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to {0} within {1}")]
        ConnectTimeout(Endpoint, humantime::Duration),
        #[error("could not switch the valves")]
        Write(#[source] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(switch(args))
    }

    async fn switch(args: Args) -> Result<(), Error> {
        let endpoint = args.connection.endpoint();
        let neptun = NeptunSmart::new(Connection::new(endpoint.clone(), || {}));
        tokio::time::timeout(*args.connect_timeout, neptun.connection().wait_connected())
            .await
            .map_err(|_| Error::ConnectTimeout(endpoint, args.connect_timeout))?;
        let open = matches!(args.state, State::Open);
        let stored = neptun
            .set_valves(args.group, open, args.groups_enabled)
            .await
            .map_err(Error::Write)?;
        info!(
            message = "valves switched",
            first_group_open = stored.valve_open_first_group,
            second_group_open = stored.valve_open_second_group
        );
        Ok(())
    }
}

pub mod watch {
    use super::WirelessSensorRecord;
    use crate::connection::{self, Connection};
    use crate::device::NeptunSmart;
    use crate::output::{self, Output};
    use std::time::Duration;
    use tokio::time::MissedTickBehavior;
    use tracing::{debug, error, info, warn};

    /// Keep polling the controller and print its state after every poll.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
        /// How often to poll the controller.
        #[arg(long, default_value = "60s")]
        interval: humantime::Duration,
        /// Number of wired sensor lines in use.
        #[arg(long, default_value = "4", value_parser = clap::value_parser!(u8).range(0..=4))]
        wired_sensors: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not output the device state")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record {
        at: jiff::Timestamp,
        valves_open: [bool; 2],
        wired_leaks: Vec<bool>,
        wireless: Vec<WirelessSensorRecord>,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let output = args.output.to_output().map_err(Error::Output)?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let wired_lines = usize::from(args.wired_sensors);
        runtime.block_on(poll(args.connection, *args.interval, wired_lines, output))
    }

    async fn poll(
        connection: connection::Args,
        interval: Duration,
        wired_lines: usize,
        mut output: Output,
    ) -> Result<(), Error> {
        let (connected_tx, mut connected_rx) = tokio::sync::mpsc::unbounded_channel();
        let connection = Connection::new(connection.endpoint(), move || {
            let _ = connected_tx.send(());
        });
        let neptun = NeptunSmart::new(connection);
        neptun.connection().wait_connected().await;
        output.table_headers(vec!["Property", "Value"]);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(()) = connected_rx.recv() => {
                    match neptun.fetch_config().await {
                        Ok(config) => info!(?config, "device connected"),
                        Err(e) => error!(
                            message = "could not obtain the device config after connecting",
                            error = (&e as &dyn std::error::Error)
                        ),
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = match neptun.fetch_snapshot().await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            warn!(
                                message = "could not update the device state",
                                error = (&e as &dyn std::error::Error)
                            );
                            continue;
                        }
                    };
                    debug!(?snapshot, "polled");
                    output
                        .result(
                            || super::snapshot_rows(&snapshot, wired_lines),
                            || Record {
                                at: jiff::Timestamp::now(),
                                valves_open: [
                                    snapshot.config.valve_open_first_group,
                                    snapshot.config.valve_open_second_group,
                                ],
                                wired_leaks: (0..wired_lines)
                                    .filter_map(|l| snapshot.wired_sensors.line(l))
                                    .collect(),
                                wireless: snapshot
                                    .wireless_sensors
                                    .iter()
                                    .map(WirelessSensorRecord::from)
                                    .collect(),
                            },
                        )
                        .map_err(Error::Output)?;
                    output.flush_table().map_err(Error::Output)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{Config, WiredSensorsStatus};

    #[test]
    fn snapshot_rows_follow_configured_lines() {
        let snapshot = DeviceSnapshot {
            config: Config { valve_open_first_group: true, ..Config::default() },
            wired_sensors: WiredSensorsStatus::from_word(0b0010),
            wireless_sensors: vec![WirelessSensorStatus::from_word(0x1305)],
        };
        let rows = snapshot_rows(&snapshot, 2);
        assert_eq!(rows[0], ["Valves group 1 open", "yes"]);
        assert_eq!(rows[1], ["Valves group 2 open", "no"]);
        let wired = rows.iter().filter(|r| r[0].starts_with("Wired")).collect::<Vec<_>>();
        assert_eq!(wired.len(), 2);
        assert_eq!(wired[1][1], "yes");
        let wireless = rows.last().unwrap();
        assert_eq!(wireless[0], "Wireless sensor 1");
        assert_eq!(wireless[1], "leak: yes, lost connection: yes, battery: 19% (low)");
    }
}
