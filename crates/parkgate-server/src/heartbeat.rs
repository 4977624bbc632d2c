use std::path::PathBuf;

use chrono::{DateTime, Duration, Local, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Clone, Copy)]
struct State {
    last_seen: DateTime<Utc>,
    alert_sent: bool,
}

/// Transition reported by [`Watchdog::tick`]; each fires once per outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEdge {
    Offline { last_seen: DateTime<Utc>, silent_for: Duration },
    Recovered { last_seen: DateTime<Utc> },
}

impl HeartbeatEdge {
    pub fn message(&self) -> String {
        match self {
            HeartbeatEdge::Offline { last_seen, silent_for } => format!(
                "【告警】现场同步程序已离线 {} 分钟\n最后心跳：{}",
                silent_for.num_minutes(),
                last_seen.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            ),
            HeartbeatEdge::Recovered { last_seen } => format!(
                "【恢复】现场同步程序已恢复在线\n恢复时间：{}",
                last_seen.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }
}

/// Tracks the last time the site agent was heard from.
pub struct Watchdog {
    state: Mutex<State>,
    timeout: Duration,
    state_path: Option<PathBuf>,
}

impl Watchdog {
    /// Starts counting from the persisted last-seen time when one is readable,
    /// otherwise from `now`.
    pub fn new(timeout_secs: u64, state_path: Option<PathBuf>, now: DateTime<Utc>) -> Self {
        let last_seen = state_path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        Self {
            state: Mutex::new(State {
                last_seen,
                alert_sent: false,
            }),
            timeout: i64::try_from(timeout_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
            state_path,
        }
    }

    pub async fn touch(&self, now: DateTime<Utc>) {
        self.state.lock().await.last_seen = now;
        if let Some(path) = &self.state_path {
            if let Err(e) = tokio::fs::write(path, now.to_rfc3339()).await {
                warn!(path = %path.display(), error = %e, "heartbeat state write failed");
            }
        }
    }

    pub async fn last_seen(&self) -> DateTime<Utc> {
        self.state.lock().await.last_seen
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Option<HeartbeatEdge> {
        let mut state = self.state.lock().await;
        let silent_for = now - state.last_seen;
        if silent_for > self.timeout {
            if state.alert_sent {
                return None;
            }
            state.alert_sent = true;
            warn!(silent_secs = silent_for.num_seconds(), "site agent offline");
            Some(HeartbeatEdge::Offline {
                last_seen: state.last_seen,
                silent_for,
            })
        } else if state.alert_sent {
            state.alert_sent = false;
            info!("site agent recovered");
            Some(HeartbeatEdge::Recovered {
                last_seen: state.last_seen,
            })
        } else {
            None
        }
    }
}

impl AppState {
    /// One watchdog check; an edge is forwarded to the admins.
    pub async fn check_heartbeat(&self, now: DateTime<Utc>) -> Option<HeartbeatEdge> {
        let edge = self.watchdog.tick(now).await?;
        self.wecom.notify_admins(&edge.message()).await;
        Some(edge)
    }
}
