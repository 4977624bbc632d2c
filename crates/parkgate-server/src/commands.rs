use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{Duration as DateDuration, NaiveDateTime};
use parkgate_kernel::command::HELP_TEXT;
use parkgate_kernel::report::{
    compute_statistics, format_admin_batches, format_multi, format_records, format_single,
    format_statistics, partition_expiring,
};
use parkgate_kernel::{normalize_plate, parse_command, Command};
use parkgate_contracts::TicketState;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::store::{BindOutcome, NewTicket};
use crate::wecom::Recipients;
use crate::{local_now, AppState};

pub const NOT_ADMIN_TEXT: &str = "您没有权限执行该指令";
const BUSY_TEXT: &str = "系统繁忙，请稍后再试";
const RECORDS_WINDOW_DAYS: i64 = 30;
const OWNER_SEARCH_CAP: usize = 200;
const STATS_HORIZON_DAYS: i64 = 30;

/// Per-user cache of the fee-records reply.
pub struct RecordsCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl RecordsCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, user_id: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(user_id)
            .filter(|(expires_at, _)| *expires_at > Instant::now())
            .map(|(_, reply)| reply.clone())
    }

    async fn put(&self, user_id: &str, reply: &str) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        entries.insert(user_id.to_string(), (now + self.ttl, reply.to_string()));
    }

    pub async fn invalidate(&self, user_id: &str) {
        self.entries.lock().await.remove(user_id);
    }
}

fn error_reply(e: &GatewayError) -> String {
    match e {
        GatewayError::NotFound(what) => format!("未找到{what}"),
        GatewayError::Conflict(why) | GatewayError::Invalid(why) => why.clone(),
        other => {
            warn!(error = %other, "command failed");
            BUSY_TEXT.to_string()
        }
    }
}

impl AppState {
    /// Runs one text command from `sender` and returns the reply text.
    pub async fn run_command(&self, text: &str, sender: &str) -> Option<String> {
        let command = match parse_command(text) {
            Ok(c) => c,
            Err(e) => return Some(e.hint),
        };
        if command.requires_admin() && !self.cfg.wecom.is_admin(sender) {
            info!(sender, command = command.name(), "privileged command refused");
            return Some(NOT_ADMIN_TEXT.to_string());
        }
        info!(sender, command = command.name(), "running command");
        let reply = match self.execute_command(command, sender, local_now()).await {
            Ok(reply) => reply,
            Err(e) => error_reply(&e),
        };
        Some(reply)
    }

    async fn execute_command(
        &self,
        command: Command,
        sender: &str,
        now: NaiveDateTime,
    ) -> Result<String, GatewayError> {
        match command {
            Command::Query(q) => self.query(&q, now).await,
            Command::Price => Ok(self.cfg.commands.fee_schedule.clone()),
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Stats => self.statistics(sender, now).await,
            Command::Records => self.records(sender, now).await,
            Command::Renew { owner, plate, months } => {
                let ticket = self.store.lock().await.insert_ticket(
                    &NewTicket {
                        owner: owner.clone(),
                        plate: plate.clone(),
                        months,
                        state: TicketState::Pending,
                        remark: format!("指令续期:{sender}"),
                    },
                    now,
                )?;
                Ok(format!(
                    "已提交续期工单 #{}\n车牌：{plate}\n车主：{owner}\n续期：{months}个月\n等待现场同步处理",
                    ticket.id
                ))
            }
            Command::Remark { plate, text } => {
                self.store.lock().await.set_remark(&plate, &text, now)?;
                Ok(format!("已更新 {plate} 的备注：{text}"))
            }
            Command::RenamePlate { old, new } => self.rename_plate(&old, &new, sender, now).await,
            Command::Delete { plate } => {
                self.store.lock().await.soft_delete(&plate, now)?;
                Ok(format!("已删除车牌 {plate}"))
            }
            Command::Bind { name, phone } => {
                let outcome = self.store.lock().await.bind(&name, &phone, sender)?;
                self.records.invalidate(sender).await;
                Ok(match outcome {
                    BindOutcome::Bound => format!("绑定成功：{name}"),
                    BindOutcome::AlreadyBound => format!("您已绑定 {name}，无需重复绑定"),
                })
            }
            Command::Unbind { name, phone } => {
                let is_admin = self.cfg.wecom.is_admin(sender);
                self.store
                    .lock()
                    .await
                    .unbind(&name, &phone, sender, is_admin)?;
                self.records.invalidate(sender).await;
                Ok(format!("已解绑 {name}"))
            }
            Command::Approval { plate, months } => {
                let (row, person) = self
                    .store
                    .lock()
                    .await
                    .find_plate(&plate)?
                    .ok_or_else(|| GatewayError::NotFound(format!("车牌 {plate}")))?;
                let sp_no = self
                    .open_renewal_approval(sender, &row, person.as_ref(), months)
                    .await?;
                Ok(format!("已发起续期审批\n车牌：{plate}\n续期：{months}个月\n审批单号：{sp_no}"))
            }
        }
    }

    async fn query(&self, q: &str, now: NaiveDateTime) -> Result<String, GatewayError> {
        let store = self.store.lock().await;
        if let Some((plate, person)) = store.find_plate(&normalize_plate(q))? {
            return Ok(format_single(&plate, person.as_ref(), now));
        }
        let rows = store.search_by_owner(q, OWNER_SEARCH_CAP)?;
        drop(store);
        Ok(match rows.as_slice() {
            [] => format!("未找到车牌或车主：{q}"),
            [(plate, person)] => format_single(plate, person.as_ref(), now),
            _ => format_multi(&rows, self.cfg.commands.query_limit, now),
        })
    }

    async fn records(&self, sender: &str, now: NaiveDateTime) -> Result<String, GatewayError> {
        if let Some(cached) = self.records.get(sender).await {
            return Ok(cached);
        }
        let since = now - DateDuration::days(RECORDS_WINDOW_DAYS);
        let store = self.store.lock().await;
        if store.person_bound_to(sender)?.is_none() {
            return Ok("您尚未绑定车主信息，请发送“绑定,姓名,手机号”".to_string());
        }
        let records = store.fee_records_for_user(sender, since)?;
        drop(store);
        let reply = format_records(&records);
        self.records.put(sender, &reply).await;
        Ok(reply)
    }

    /// Summary reply plus the expiring-plate detail sent as follow-up messages.
    async fn statistics(&self, sender: &str, now: NaiveDateTime) -> Result<String, GatewayError> {
        let (rows, persons) = {
            let store = self.store.lock().await;
            (store.active_plates()?, store.persons()?)
        };
        let stats = compute_statistics(&rows, &persons, now);
        let scan = partition_expiring(&rows, now, STATS_HORIZON_DAYS, self.cfg.scanner.expired_days);
        let batches = format_admin_batches(&scan, self.cfg.scanner.admin_batch_size);
        if !batches.is_empty() {
            let wecom = self.wecom.clone();
            let to = Recipients::user(sender);
            tokio::spawn(async move {
                for batch in batches {
                    if let Err(e) = wecom.send_text(&to, &batch).await {
                        warn!(error = %e, "statistics detail send failed");
                    }
                }
            });
        }
        Ok(format_statistics(&stats))
    }

    async fn rename_plate(
        &self,
        old: &str,
        new: &str,
        sender: &str,
        now: NaiveDateTime,
    ) -> Result<String, GatewayError> {
        let mut store = self.store.lock().await;
        let (_, person) = store
            .find_plate(old)?
            .ok_or_else(|| GatewayError::NotFound(format!("车牌 {old}")))?;
        let owns = person
            .as_ref()
            .and_then(|p| p.wecom_userid.as_deref())
            .is_some_and(|uid| uid == sender);
        if !owns && !self.cfg.wecom.is_admin(sender) {
            return Err(GatewayError::Conflict("只能修改本人名下的车牌".to_string()));
        }
        if store.find_plate(new)?.is_some() {
            return Err(GatewayError::Conflict(format!("新车牌 {new} 已存在")));
        }
        let ticket = store.insert_ticket(
            &NewTicket {
                owner: person.map(|p| p.name).unwrap_or_default(),
                plate: old.to_string(),
                months: 0,
                state: TicketState::Change,
                remark: new.to_string(),
            },
            now,
        )?;
        Ok(format!("已提交车牌变更：{old} → {new}\n工单 #{}，等待现场同步处理", ticket.id))
    }
}
