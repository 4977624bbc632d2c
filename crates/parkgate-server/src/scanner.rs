use chrono::{Duration, NaiveDateTime, NaiveTime};
use parkgate_kernel::report::{
    format_admin_batches, format_admin_summary, format_user_notice, group_by_user,
    partition_expiring,
};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::wecom::Recipients;
use crate::AppState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub soon: usize,
    pub expired: usize,
    pub users_notified: usize,
    pub admin_messages: usize,
    pub failures: usize,
}

/// First `hour:minute` strictly after `now`.
pub fn next_run(now: NaiveDateTime, hour: u32, minute: u32) -> NaiveDateTime {
    let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

impl AppState {
    /// Notifies bound owners of their expiring plates, then sends admins a
    /// summary and batched detail. Send failures are counted, not fatal.
    pub async fn run_expiry_scan(&self, now: NaiveDateTime) -> Result<ScanReport, GatewayError> {
        let rows = self.store.lock().await.active_plates()?;
        let scan = partition_expiring(
            &rows,
            now,
            self.cfg.scanner.soon_days,
            self.cfg.scanner.expired_days,
        );
        let mut report = ScanReport {
            soon: scan.soon.len(),
            expired: scan.expired.len(),
            ..ScanReport::default()
        };
        if scan.is_empty() {
            info!("expiry scan found nothing");
            return Ok(report);
        }

        for (user_id, own) in group_by_user(&scan) {
            match self
                .wecom
                .send_text(&Recipients::user(&user_id), &format_user_notice(&own))
                .await
            {
                Ok(_) => report.users_notified += 1,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "expiry notice failed");
                    report.failures += 1;
                }
            }
        }

        let admin = self.wecom.default_receivers().clone();
        let messages = std::iter::once(format_admin_summary(&scan))
            .chain(format_admin_batches(&scan, self.cfg.scanner.admin_batch_size));
        for message in messages {
            match self.wecom.send_text(&admin, &message).await {
                Ok(_) => report.admin_messages += 1,
                Err(e) => {
                    warn!(error = %e, "expiry summary failed");
                    report.failures += 1;
                }
            }
        }
        info!(
            soon = report.soon,
            expired = report.expired,
            users = report.users_notified,
            failures = report.failures,
            "expiry scan finished"
        );
        Ok(report)
    }
}
