//! CE102M power meter polling. One gather pass reads the device clock,
//! conditionally the status register, and the per-tariff energy totals,
//! and turns them into tagged metric records.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, warn};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::Ce102mConfig;
use crate::iec62056::{Command, Dialer, TransportError};
use crate::mqtt::Accumulator;

pub mod duration;
pub mod session;
pub mod status;
pub mod tariff;

use duration::PollInterval;
use session::MeterSession;
use tariff::{TariffFilter, MAX_TARIFF_ID};

pub const MEASUREMENT: &str = "ce102m";

const KEY_METER_ID: &str = "id";
const KEY_ERROR: &str = "error_key";
const KEY_ERR_DESC: &str = "error_description";
const KEY_NET_STATUS: &str = "net_status";

const ADDR_DATE: &str = "DATE_";
const ADDR_TIME: &str = "TIME_";
const ADDR_STATUS: &str = "STAT_";
const ADDR_ENERGY: &str = "ET0PE";

const SYSTIME_FORMAT: &str = "%d.%m.%y %H:%M:%S";
const MAX_RETRIES: usize = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("socket is required")]
    SocketRequired,
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid tariff {0}")]
    InvalidTariff(u8),
}

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("not connected")]
    NotConnected,
    #[error("empty result for {0} request")]
    EmptyResult(&'static str),
    #[error("unable to parse date string: '{0}'")]
    BadTimestamp(String),
    #[error("system status parse error: '{0}'")]
    BadStatus(String),
    #[error("unable to parse value '{0}'")]
    BadValue(String),
}

pub struct Ce102mDevice<D: Dialer> {
    name: String,
    session: MeterSession<D>,
    tariffs: TariffFilter,
    prefix: String,
    status_interval: PollInterval,
    tz: Tz,
    last_status_time: Option<DateTime<Utc>>,
    prev_connected: bool,
}

impl<D: Dialer> Ce102mDevice<D> {
    pub fn new(cfg: &Ce102mConfig, dialer: D) -> Result<Self, ConfigError> {
        if cfg.socket.is_empty() {
            return Err(ConfigError::SocketRequired);
        }
        let tz = if cfg.systime_tz.is_empty() {
            Tz::UTC
        } else {
            Tz::from_str(&cfg.systime_tz)
                .map_err(|_| ConfigError::InvalidTimezone(cfg.systime_tz.clone()))?
        };
        let tariffs = TariffFilter::build(&cfg.tariff_include)?;

        Ok(Ce102mDevice {
            name: cfg.name.clone(),
            session: MeterSession::new(dialer, cfg.socket.clone(), cfg.address.clone()),
            tariffs,
            prefix: cfg.tariff_prefix.clone(),
            status_interval: cfg.status_interval,
            tz,
            last_status_time: None,
            prev_connected: false,
        })
    }

    /// One polling pass. Emits the gathered records plus, on a connectivity
    /// edge, a single `net_status` record stamped with the pass's device
    /// time (wall clock when the time phase failed).
    pub async fn gather<A: Accumulator>(&mut self, acc: &mut A) -> Result<(), MeterError> {
        let (t, result) = self.gather_data(acc).await;

        if self.prev_connected != self.session.is_connected() {
            let status = if self.session.is_connected() {
                "online"
            } else {
                "offline"
            };
            let mut fields = Map::new();
            fields.insert(KEY_NET_STATUS.to_string(), Value::from(status));
            acc.add_fields(MEASUREMENT, fields, self.tags(), t);
            self.prev_connected = self.session.is_connected();
        }
        result
    }

    /// Time, status, values, in that order. Each phase is retried up to
    /// three times; the first exhausted phase aborts the rest of the pass.
    async fn gather_data<A: Accumulator>(
        &mut self,
        acc: &mut A,
    ) -> (DateTime<Utc>, Result<(), MeterError>) {
        let t = match self.systime_with_retry().await {
            Ok(t) => t,
            Err(e) => {
                warn!("{}: systime gather error: {}", self.name, e);
                return (Utc::now(), Err(e));
            }
        };

        if let Err(e) = self.status_with_retry(acc, t).await {
            warn!("{}: status gather error: {}", self.name, e);
            return (t, Err(e));
        }

        if let Err(e) = self.values_with_retry(acc, t).await {
            warn!("{}: values gather error: {}", self.name, e);
            return (t, Err(e));
        }

        (t, Ok(()))
    }

    fn tags(&self) -> HashMap<String, String> {
        HashMap::from([(KEY_METER_ID.to_string(), self.session.meter_id().to_string())])
    }

    async fn systime_with_retry(&mut self) -> Result<DateTime<Utc>, MeterError> {
        let mut attempt = 0;
        loop {
            match self.systime().await {
                Ok(t) => return Ok(t),
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    debug!("{}: systime attempt {} failed: {}", self.name, attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Device system time, from the DATE_ and TIME_ registers combined.
    async fn systime(&mut self) -> Result<DateTime<Utc>, MeterError> {
        let block = self.session.command(&Command::read(ADDR_DATE)).await?;
        let date = block
            .first_value()
            .ok_or(MeterError::EmptyResult("system date"))?;
        // The first three characters carry a day-of-week code.
        let date = date
            .get(3..)
            .ok_or_else(|| MeterError::BadTimestamp(date.to_string()))?
            .to_string();

        let block = self.session.command(&Command::read(ADDR_TIME)).await?;
        let time = block
            .first_value()
            .ok_or(MeterError::EmptyResult("system time"))?;

        let combined = format!("{date} {time}");
        let naive = NaiveDateTime::parse_from_str(&combined, SYSTIME_FORMAT)
            .map_err(|_| MeterError::BadTimestamp(combined.clone()))?;
        let local = self
            .tz
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| MeterError::BadTimestamp(combined.clone()))?;
        Ok(local.with_timezone(&Utc))
    }

    async fn status_with_retry<A: Accumulator>(
        &mut self,
        acc: &mut A,
        t: DateTime<Utc>,
    ) -> Result<(), MeterError> {
        if self.status_interval.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.last_status_time {
            if self.status_interval.until(last) > chrono::Duration::zero() {
                return Ok(());
            }
        }

        let mut attempt = 0;
        let faults = loop {
            match self.current_state().await {
                Ok(faults) => break faults,
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    debug!("{}: status attempt {} failed: {}", self.name, attempt, e);
                }
                Err(e) => return Err(e),
            }
        };

        for (key, description) in faults {
            let mut fields = Map::new();
            fields.insert(KEY_ERROR.to_string(), Value::from(key));
            fields.insert(KEY_ERR_DESC.to_string(), Value::from(description));
            acc.add_fields(MEASUREMENT, fields, self.tags(), t);
        }
        // Even a clean status counts as a completed poll.
        self.last_status_time = Some(Utc::now());
        Ok(())
    }

    async fn current_state(&mut self) -> Result<Vec<(&'static str, &'static str)>, MeterError> {
        debug!("{}: device status request started", self.name);
        let block = self.session.command(&Command::read(ADDR_STATUS)).await?;
        let raw = block
            .first_value()
            .ok_or(MeterError::EmptyResult("system status"))?;
        let mask = u32::from_str_radix(raw.trim(), 16)
            .map_err(|_| MeterError::BadStatus(raw.to_string()))?;
        Ok(status::decode(mask))
    }

    async fn values_with_retry<A: Accumulator>(
        &mut self,
        acc: &mut A,
        t: DateTime<Utc>,
    ) -> Result<(), MeterError> {
        let mut attempt = 0;
        let fields = loop {
            match self.current_values().await {
                Ok(fields) => break fields,
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    debug!("{}: values attempt {} failed: {}", self.name, attempt, e);
                }
                Err(e) => return Err(e),
            }
        };
        acc.add_fields(MEASUREMENT, fields, self.tags(), t);
        Ok(())
    }

    /// Per-tariff energy totals. The meter answers one line per wire-reported
    /// tariff slot; anything past the fifth line is ignored.
    async fn current_values(&mut self) -> Result<Map<String, Value>, MeterError> {
        let cmd = match self.tariffs.wire_arg() {
            Some(arg) => Command::read_arg(ADDR_ENERGY, arg),
            None => Command::read(ADDR_ENERGY),
        };

        debug!("{}: current values request started", self.name);
        let block = self.session.command(&cmd).await?;
        if block.is_empty() {
            warn!("{}: current values empty result", self.name);
            return Err(MeterError::EmptyResult("current values"));
        }

        let mut fields = Map::new();
        for (offset, line) in block.lines.iter().take(MAX_TARIFF_ID).enumerate() {
            for set in &line.sets {
                match &self.tariffs {
                    TariffFilter::Single { id, .. } => {
                        let value = parse_counter(&set.value)?;
                        fields.insert(format!("{}{}", self.prefix, id), Value::from(value));
                        return Ok(fields);
                    }
                    TariffFilter::All => {
                        let value = parse_counter(&set.value)?;
                        fields.insert(format!("{}{}", self.prefix, offset + 1), Value::from(value));
                    }
                    TariffFilter::Range { min, mask, .. } => {
                        let absolute = *min as usize + offset;
                        if mask.get(absolute - 1).copied().unwrap_or(false) {
                            let value = parse_counter(&set.value)?;
                            fields.insert(format!("{}{}", self.prefix, absolute), Value::from(value));
                        }
                    }
                }
            }
        }
        Ok(fields)
    }
}

/// The meter reports fixed-point counters with a literal decimal separator
/// that is removed, not rounded: "0001.234" is the integer 1234.
fn parse_counter(raw: &str) -> Result<u64, MeterError> {
    raw.replacen('.', "", 1)
        .parse::<u32>()
        .map(u64::from)
        .map_err(|_| MeterError::BadValue(raw.to_string()))
}
