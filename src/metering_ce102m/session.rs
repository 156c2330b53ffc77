//! Connection lifecycle for one meter. A session keeps a single live
//! transport handle and two lazily resolved, cached facts about the device:
//! its session idle timeout (`ACTIV`) and its serial number (`SNUMB`).
//! Both survive reconnects and are only dropped by an explicit reset.

use std::time::Duration;

use log::{debug, warn};

use crate::iec62056::{Command, DataBlock, Dialer, Transport};

use super::MeterError;

const ADDR_IDLE_TIMEOUT: &str = "ACTIV";
const ADDR_SERIAL: &str = "SNUMB";

pub struct MeterSession<D: Dialer> {
    dialer: D,
    socket: String,
    address: String,
    conn: Option<D::Conn>,
    is_connected: bool,
    idle_timeout: Option<Duration>,
    meter_id: Option<String>,
}

impl<D: Dialer> MeterSession<D> {
    pub fn new(dialer: D, socket: String, address: String) -> Self {
        MeterSession {
            dialer,
            socket,
            address,
            conn: None,
            is_connected: false,
            idle_timeout: None,
            meter_id: None,
        }
    }

    /// Last known connection health, not a liveness probe.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Cached device serial number; empty until the first successful connect.
    pub fn meter_id(&self) -> &str {
        self.meter_id.as_deref().unwrap_or("")
    }

    /// Forgets the cached device identity and idle timeout so the next
    /// connect resolves them again.
    pub fn reset_identity(&mut self) {
        self.idle_timeout = None;
        self.meter_id = None;
        self.is_connected = false;
    }

    /// Dispatches one command, connecting first when needed. Any transport
    /// failure marks the session disconnected so the next call reconnects;
    /// retrying is the caller's job.
    pub async fn command(&mut self, cmd: &Command) -> Result<DataBlock, MeterError> {
        if !self.is_connected {
            self.reconnect().await?;
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(MeterError::NotConnected);
        };
        match conn.command(cmd).await {
            Ok(block) => Ok(block),
            Err(e) => {
                self.is_connected = false;
                Err(MeterError::Transport(e))
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), MeterError> {
        if let Some(stale) = self.conn.take() {
            stale.close().await;
        }

        debug!("connecting to meter at {}", self.socket);
        let mut conn = self
            .dialer
            .dial(&self.socket, &self.address)
            .await
            .map_err(MeterError::Connection)?;

        if self.idle_timeout.is_none() {
            debug!("requesting session idle timeout");
            match query_idle_timeout(&mut conn).await {
                Ok(timeout) => self.idle_timeout = Some(timeout),
                Err(e) => {
                    warn!("session idle timeout request failed");
                    conn.close().await;
                    return Err(e);
                }
            }
        }
        if let Some(timeout) = self.idle_timeout {
            conn.set_idle_timeout(timeout);
        }

        if self.meter_id.is_none() {
            debug!("requesting meter serial number");
            match query_value(&mut conn, ADDR_SERIAL, "serial number").await {
                Ok(id) => self.meter_id = Some(id),
                Err(e) => {
                    warn!("meter serial number request failed");
                    conn.close().await;
                    return Err(e);
                }
            }
        }

        self.conn = Some(conn);
        self.is_connected = true;
        Ok(())
    }
}

async fn query_value<T: Transport>(
    conn: &mut T,
    address: &str,
    what: &'static str,
) -> Result<String, MeterError> {
    let block = conn
        .command(&Command::read(address))
        .await
        .map_err(MeterError::Transport)?;
    block
        .first_value()
        .map(str::to_string)
        .ok_or(MeterError::EmptyResult(what))
}

async fn query_idle_timeout<T: Transport>(conn: &mut T) -> Result<Duration, MeterError> {
    let raw = query_value(conn, ADDR_IDLE_TIMEOUT, "session timeout").await?;
    let seconds: u64 = raw
        .trim()
        .parse()
        .map_err(|_| MeterError::BadValue(raw.clone()))?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iec62056::testing::MockDialer;

    fn session(dialer: &MockDialer) -> MeterSession<MockDialer> {
        MeterSession::new(dialer.clone(), "localhost:4001".to_string(), String::new())
    }

    #[tokio::test]
    async fn resolves_identity_once_per_session() {
        let dialer = MockDialer::healthy();
        dialer.on("STAT_", "STAT_(0)");
        let mut session = session(&dialer);

        session.command(&Command::read("STAT_")).await.unwrap();
        session.command(&Command::read("STAT_")).await.unwrap();

        let state = dialer.state();
        assert_eq!(state.dials, 1);
        assert_eq!(state.sent("ACTIV"), 1);
        assert_eq!(state.sent("SNUMB"), 1);
        drop(state);
        assert_eq!(session.meter_id(), "123456789");
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn command_failure_forces_reconnect_without_refetch() {
        let dialer = MockDialer::healthy();
        dialer.on("STAT_", "STAT_(0)");
        dialer.once("STAT_", Err(()));
        let mut session = session(&dialer);

        // First command connects, then hits the injected failure.
        let err = session.command(&Command::read("STAT_")).await.unwrap_err();
        assert!(matches!(err, MeterError::Transport(_)));
        assert!(!session.is_connected());

        session.command(&Command::read("STAT_")).await.unwrap();

        let state = dialer.state();
        assert_eq!(state.dials, 2);
        assert_eq!(state.closes, 1, "stale connection must be closed");
        assert_eq!(state.sent("ACTIV"), 1, "idle timeout stays cached");
        assert_eq!(state.sent("SNUMB"), 1, "meter id stays cached");
    }

    #[tokio::test]
    async fn explicit_reset_refetches_identity() {
        let dialer = MockDialer::healthy();
        dialer.on("STAT_", "STAT_(0)");
        let mut session = session(&dialer);

        session.command(&Command::read("STAT_")).await.unwrap();
        session.reset_identity();
        session.command(&Command::read("STAT_")).await.unwrap();

        let state = dialer.state();
        assert_eq!(state.sent("ACTIV"), 2);
        assert_eq!(state.sent("SNUMB"), 2);
    }

    #[tokio::test]
    async fn identity_failure_aborts_connect_and_closes() {
        let dialer = MockDialer::healthy();
        dialer.once("ACTIV", Err(()));
        let mut session = session(&dialer);

        let err = session.command(&Command::read("STAT_")).await.unwrap_err();
        assert!(matches!(err, MeterError::Transport(_)));
        assert!(!session.is_connected());

        let state = dialer.state();
        assert_eq!(state.dials, 1);
        assert_eq!(state.closes, 1, "fresh connection must not leak");
        assert_eq!(state.sent("STAT_"), 0, "command must not reach the meter");
    }

    #[tokio::test]
    async fn dial_failure_surfaces_as_connection_error() {
        let dialer = MockDialer::healthy();
        dialer.fail_next_dials(1);
        let mut session = session(&dialer);

        let err = session.command(&Command::read("STAT_")).await.unwrap_err();
        assert!(matches!(err, MeterError::Connection(_)));
        assert_eq!(session.meter_id(), "");
    }
}
