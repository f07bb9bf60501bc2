//! Liveness watchdogs
//!
//! Time-driven tasks enforcing establishment, ping, idle, and forced-close
//! deadlines. Each watchdog runs inside its record's failure group; a
//! deadline miss is an error, which the supervisor fans out to the sibling
//! tasks as cancellation. Timeouts are periodic wakeups plus state checks,
//! never deadlines on individual I/O calls.

use super::{monotonic_ns, ConnRecord, Frame, RelayError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Wait for the record to become established, one-second ticks.
///
/// Returns `Ok(true)` once established, `Ok(false)` on cancellation. The
/// established flag is re-checked on wake-up before the tick is counted, so
/// a record that came up during the first sleep never gets charged for it.
async fn wait_established(
    token: &CancellationToken,
    record: &ConnRecord,
    established_timeout: u64,
) -> Result<bool, RelayError> {
    let mut ticks = 0u64;
    loop {
        if record.is_established() {
            return Ok(true);
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(false),
            _ = sleep(Duration::from_secs(1)) => {}
        }

        if record.is_established() {
            return Ok(true);
        }

        ticks += 1;
        if ticks > established_timeout {
            error!(info = record.info(), "established timeout");
            return Err(RelayError::EstablishmentTimeout);
        }
    }
}

/// Main-channel watchdog: establishment phase, then the ping loop.
///
/// Every `ping_interval` seconds the pending-ping count is checked first;
/// `ping_timeout_count` unanswered pings kill the channel. Otherwise a PING
/// stamped with local monotonic nanoseconds is enqueued. Pings are not
/// individually matched to pongs.
pub async fn check_main_active(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    established_timeout: u64,
    ping_interval: u64,
    ping_timeout_count: u32,
) -> Result<(), RelayError> {
    if !wait_established(&token, &record, established_timeout).await? {
        return Ok(());
    }

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = sleep(Duration::from_secs(ping_interval)) => {}
        }

        if record.pending_pings() >= ping_timeout_count {
            error!(info = record.info(), "ping pong timeout");
            return Err(RelayError::PingTimeout);
        }

        let frame = Frame::Ping {
            time: monotonic_ns(),
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            res = record.outbound().send(frame) => {
                if res.is_err() {
                    return Err(RelayError::QueueClosed);
                }
            }
        }
        record.ping_sent();
        debug!(info = record.info(), pending = record.pending_pings(), "ping");
    }
}

/// Sub-connection watchdog: establishment phase, then the idle loop.
///
/// Each `conn_idle_timeout` tick reads and resets the activity counter; a
/// window with zero moved frames kills the sub-connection.
pub async fn check_conn_active(
    token: CancellationToken,
    record: Arc<ConnRecord>,
    established_timeout: u64,
    conn_idle_timeout: u64,
) -> Result<(), RelayError> {
    if !wait_established(&token, &record, established_timeout).await? {
        return Ok(());
    }

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = sleep(Duration::from_secs(conn_idle_timeout)) => {}
        }

        if record.take_activity() == 0 {
            error!(info = record.info(), id = record.id(), "conn timeout");
            return Err(RelayError::IdleTimeout);
        }
    }
}

/// Forced-close watcher: polls the latched `needs_close` flag every second.
pub async fn check_needs_close(
    token: CancellationToken,
    record: Arc<ConnRecord>,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            _ = sleep(Duration::from_secs(1)) => {}
        }

        if record.needs_close() {
            error!(info = record.info(), id = record.id(), "needclose");
            return Err(RelayError::ForcedClose);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> Arc<ConnRecord> {
        ConnRecord::new(id.to_string(), "test".to_string(), 16).0
    }

    #[tokio::test(start_paused = true)]
    async fn test_establishment_timeout() {
        let token = CancellationToken::new();
        let rec = record("");

        let err = check_main_active(token, rec, 2, 1, 5).await.unwrap_err();
        assert!(matches!(err, RelayError::EstablishmentTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_established_during_first_sleep_is_tolerated() {
        let token = CancellationToken::new();
        let rec = record("abc");

        let watcher = tokio::spawn(check_conn_active(token.clone(), rec.clone(), 0, 1000));

        // Establish before the first one-second tick lands.
        tokio::time::sleep(Duration::from_millis(500)).await;
        rec.set_established();

        // The zero-budget watchdog must not fire its establishment timeout.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!watcher.is_finished());

        token.cancel();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_window() {
        let token = CancellationToken::new();
        let rec = record("");
        rec.set_established();

        let started = tokio::time::Instant::now();
        let err = check_main_active(token, rec.clone(), 10, 1, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PingTimeout));
        // interval * (count + 1) seconds of silence
        assert_eq!(started.elapsed().as_secs(), 6);
        assert_eq!(rec.pending_pings(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_channel_alive() {
        let token = CancellationToken::new();
        let rec = record("");
        rec.set_established();

        let watcher = tokio::spawn(check_main_active(token.clone(), rec.clone(), 10, 1, 2));

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            rec.pong_received();
        }
        assert!(!watcher.is_finished());

        token.cancel();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_on_quiet_window() {
        let token = CancellationToken::new();
        let rec = record("abc");
        rec.set_established();

        let err = check_conn_active(token, rec, 10, 3).await.unwrap_err();
        assert!(matches!(err, RelayError::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_idle_window() {
        let token = CancellationToken::new();
        let rec = record("abc");
        rec.set_established();

        let watcher = tokio::spawn(check_conn_active(token.clone(), rec.clone(), 10, 2));

        // Touch mid-window so every idle check sees fresh activity.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            rec.touch_activity();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(!watcher.is_finished());

        token.cancel();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_close_watcher() {
        let token = CancellationToken::new();
        let rec = record("abc");

        let watcher = tokio::spawn(check_needs_close(token, rec.clone()));

        rec.request_close();
        let err = watcher.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::ForcedClose));
    }
}
