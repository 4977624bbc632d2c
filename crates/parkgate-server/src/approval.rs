//! Approved renewal forms become plate renewals, fee records and tickets.

use chrono::NaiveDateTime;
use parkgate_contracts::{Person, Plate, APPROVAL_STATUS_APPROVED};
use parkgate_kernel::approval_form::{
    control_id_for_title, parse_template_controls, FIELD_MONTHS, FIELD_OWNER, FIELD_PLATE,
};
use parkgate_kernel::{extract_renewal_form, RenewalForm};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::store::AppliedApproval;
use crate::wecom::{ApprovalControl, CreateApproval};
use crate::{local_now, AppState};

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Not in the approved state; nothing to do.
    Ignored,
    Applied(AppliedApproval),
    Duplicate,
    Failed(String),
}

fn date_text(ts: Option<NaiveDateTime>) -> String {
    ts.map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "未设置".to_string())
}

fn success_text(sp_no: &str, form: &RenewalForm, applied: &AppliedApproval) -> String {
    format!(
        "续期审批已处理\n审批单号：{sp_no}\n车牌：{}\n车主：{}\n车辆类型：{}\n续期：{}个月\n金额：{}\n新到期时间：{}",
        applied.plate.plate,
        applied.owner,
        applied.plate.class.label(),
        form.months,
        form.money,
        date_text(applied.plate.end_time)
    )
}

fn failure_text(sp_no: &str, form: Option<&RenewalForm>, reason: &str) -> String {
    let mut out = format!("续期审批处理失败\n审批单号：{sp_no}");
    if let Some(form) = form {
        out.push_str(&format!(
            "\n车牌：{}\n车主：{}\n车辆类型：{}",
            form.plate,
            if form.owner.is_empty() { "未知" } else { form.owner.as_str() },
            form.class().label()
        ));
    }
    out.push_str(&format!("\n原因：{reason}"));
    out
}

impl AppState {
    /// Handles one approval status change. Only approved tickets are applied,
    /// and each sp_no is applied at most once.
    pub async fn process_approval(&self, sp_no: &str, status: i64) -> ApprovalOutcome {
        if status != APPROVAL_STATUS_APPROVED {
            debug!(sp_no, status, "approval not approved yet");
            return ApprovalOutcome::Ignored;
        }
        let seen = self.store.lock().await.approval_seen(sp_no);
        match seen {
            Ok(true) => return self.duplicate(sp_no).await,
            Ok(false) => {}
            Err(e) => {
                warn!(sp_no, error = %e, "approval lookup failed");
                return ApprovalOutcome::Failed(e.to_string());
            }
        }

        let record = match self.wecom.get_approval_detail(sp_no).await {
            Ok(r) => r,
            Err(e) => {
                warn!(sp_no, error = %e, "approval detail fetch failed");
                return ApprovalOutcome::Failed(e.to_string());
            }
        };
        let form = match extract_renewal_form(&record, &self.cfg.wecom.approval_controls) {
            Ok(f) => f,
            Err(reason) => {
                warn!(sp_no, reason = %reason, "approval form unusable");
                self.wecom
                    .notify_admins(&failure_text(sp_no, None, &reason))
                    .await;
                return ApprovalOutcome::Failed(reason);
            }
        };

        let result = self
            .store
            .lock()
            .await
            .apply_approval(sp_no, &form, local_now());
        match result {
            Ok(applied) => {
                if !form.owner.is_empty()
                    && !applied.recorded_owner.is_empty()
                    && form.owner != applied.recorded_owner
                {
                    info!(
                        sp_no,
                        form_owner = %form.owner,
                        recorded_owner = %applied.recorded_owner,
                        "approval owner differs from recorded owner"
                    );
                }
                info!(
                    sp_no,
                    plate = %applied.plate.plate,
                    ticket = applied.ticket_id,
                    fee_record = applied.fee_id,
                    "approval applied"
                );
                self.wecom
                    .notify_admins(&success_text(sp_no, &form, &applied))
                    .await;
                ApprovalOutcome::Applied(applied)
            }
            Err(GatewayError::Conflict(_)) => self.duplicate(sp_no).await,
            Err(e) => {
                let reason = match &e {
                    GatewayError::NotFound(what) => format!("未找到{what}"),
                    other => other.to_string(),
                };
                warn!(sp_no, error = %e, "approval not applied");
                self.wecom
                    .notify_admins(&failure_text(sp_no, Some(&form), &reason))
                    .await;
                ApprovalOutcome::Failed(reason)
            }
        }
    }

    async fn duplicate(&self, sp_no: &str) -> ApprovalOutcome {
        info!(sp_no, "approval already processed");
        self.wecom
            .notify_admins(&format!("审批单号 {sp_no} 已经处理过，忽略重复通知"))
            .await;
        ApprovalOutcome::Duplicate
    }

    /// Opens a renewal approval on behalf of `creator`. Control ids come from
    /// configuration, falling back to the template's control titles.
    pub async fn open_renewal_approval(
        &self,
        creator: &str,
        plate: &Plate,
        person: Option<&Person>,
        months: u32,
    ) -> Result<String, GatewayError> {
        let wecom_cfg = &self.cfg.wecom;
        let mut ids = wecom_cfg.approval_controls.clone();
        if [FIELD_PLATE, FIELD_OWNER, FIELD_MONTHS]
            .iter()
            .any(|f| !ids.contains_key(*f))
        {
            let template = self
                .wecom
                .get_template_detail(&wecom_cfg.approval_template_id)
                .await?;
            let controls = parse_template_controls(&template);
            for field in [FIELD_PLATE, FIELD_OWNER, FIELD_MONTHS] {
                if let Some(id) = control_id_for_title(&controls, field) {
                    ids.entry(field.to_string()).or_insert_with(|| id.to_string());
                }
            }
        }
        let (Some(plate_id), Some(months_id)) = (ids.get(FIELD_PLATE), ids.get(FIELD_MONTHS)) else {
            return Err(GatewayError::Invalid(
                "审批模板缺少车牌或续期月数控件".to_string(),
            ));
        };

        let owner = person.map(|p| p.name.as_str()).unwrap_or_default();
        let mut contents = vec![
            ApprovalControl::text(plate_id, &plate.plate),
            ApprovalControl::number(months_id, months),
        ];
        if let Some(owner_id) = ids.get(FIELD_OWNER).filter(|_| !owner.is_empty()) {
            contents.push(ApprovalControl::text(owner_id, owner));
        }
        let approvers = if wecom_cfg.approvers.is_empty() {
            wecom_cfg.admins().to_vec()
        } else {
            wecom_cfg.approvers.clone()
        };
        let sp_no = self
            .wecom
            .create_approval(&CreateApproval {
                creator: creator.to_string(),
                template_id: wecom_cfg.approval_template_id.clone(),
                approvers,
                contents,
                summary: vec![
                    format!("车牌：{}", plate.plate),
                    format!("车主：{owner}"),
                    format!("续期：{months}个月"),
                ],
            })
            .await?;
        info!(sp_no = %sp_no, plate = %plate.plate, creator, "renewal approval opened");
        Ok(sp_no)
    }
}
