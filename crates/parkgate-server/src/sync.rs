//! Endpoints used by the site agent to mirror the on-premise database.

use axum::http::HeaderMap;
use chrono::Utc;
use parkgate_contracts::{
    CarParkQuery, CarParkRecord, CarParkSnapshot, ClientAlive, RenewalTicket, ReviewUpdate,
    TicketState,
};
use parkgate_kernel::normalize_plate;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::store::{Transition, UpsertCounts};
use crate::{local_now, AppState};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Query string accepted by the agent endpoints; the key may also travel here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentQuery {
    pub api_key: Option<String>,
    pub car_number: Option<String>,
    pub owner_name: Option<String>,
    pub status: Option<String>,
    pub process_id: Option<String>,
    pub memory_usage: Option<String>,
    pub cpu_usage: Option<String>,
}

impl AgentQuery {
    pub fn car_park(&self) -> CarParkQuery {
        CarParkQuery {
            car_number: self.car_number.as_deref().map(normalize_plate),
            owner_name: self.owner_name.clone(),
        }
    }

    pub fn client_alive(&self) -> ClientAlive {
        ClientAlive {
            status: self.status.clone(),
            process_id: self.process_id.clone(),
            memory_usage: self.memory_usage.clone(),
            cpu_usage: self.cpu_usage.clone(),
        }
    }
}

fn transition_text(t: &Transition) -> String {
    let ticket = &t.ticket;
    match ticket.state {
        TicketState::Complete => format!(
            "续期工单 #{} 已完成\n车牌：{}\n车主：{}\n续期：{}个月",
            ticket.id, ticket.plate, ticket.owner, ticket.months
        ),
        TicketState::Changed => format!(
            "车牌变更工单 #{} 已完成\n{} → {}",
            ticket.id, ticket.plate, ticket.remark
        ),
        _ => format!(
            "工单 #{} 处理失败\n车牌：{}\n车主：{}\n原因：{}",
            ticket.id,
            ticket.plate,
            ticket.owner,
            if ticket.comment.is_empty() { "未说明" } else { ticket.comment.as_str() }
        ),
    }
}

fn alive_alert(alive: &ClientAlive) -> Option<String> {
    let status = alive.status.as_deref()?;
    if status.eq_ignore_ascii_case("running") {
        return None;
    }
    let or_dash = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    Some(format!(
        "【告警】现场同步程序状态异常\n状态：{status}\n进程：{}\n内存：{}\nCPU：{}",
        or_dash(&alive.process_id),
        or_dash(&alive.memory_usage),
        or_dash(&alive.cpu_usage)
    ))
}

impl AppState {
    /// Accepts the key from the `X-API-Key` header or the `api_key` query field.
    pub fn authorize_agent(&self, headers: &HeaderMap, query_key: Option<&str>) -> Result<(), GatewayError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .or(query_key);
        match presented {
            Some(key) if key == self.cfg.agent.api_key => Ok(()),
            _ => Err(GatewayError::AuthenticationFailed),
        }
    }

    async fn agent_seen(&self) {
        self.watchdog.touch(Utc::now()).await;
    }

    pub async fn review_list(&self) -> Result<Vec<RenewalTicket>, GatewayError> {
        let tickets = self.store.lock().await.open_tickets()?;
        self.agent_seen().await;
        Ok(tickets)
    }

    pub async fn review_update(&self, update: ReviewUpdate) -> Result<RenewalTicket, GatewayError> {
        if !update.status.is_terminal() {
            return Err(GatewayError::Invalid(format!(
                "status must be complete, changed or failed, got {}",
                update.status.as_str()
            )));
        }
        let plate = normalize_plate(&update.car_number);
        let transition = self.store.lock().await.transition_oldest_open(
            &plate,
            update.status,
            &update.comment,
            local_now(),
        )?;
        self.agent_seen().await;
        info!(
            ticket = transition.ticket.id,
            plate = %plate,
            state = transition.ticket.state.as_str(),
            "ticket closed by site agent"
        );
        if let Some(reason) = &transition.failure {
            warn!(ticket = transition.ticket.id, reason = %reason, "ticket failed on apply");
        }

        let text = transition_text(&transition);
        let wecom = self.wecom.clone();
        tokio::spawn(async move {
            wecom.notify_admins(&text).await;
        });
        Ok(transition.ticket)
    }

    pub async fn car_park_lookup(&self, q: &CarParkQuery) -> Result<CarParkRecord, GatewayError> {
        let found = self
            .store
            .lock()
            .await
            .lookup(q.car_number.as_deref(), q.owner_name.as_deref())?;
        self.agent_seen().await;
        found.ok_or_else(|| GatewayError::NotFound("car park record".to_string()))
    }

    pub async fn car_park_dump(&self) -> Result<CarParkSnapshot, GatewayError> {
        let snapshot = self.store.lock().await.snapshot()?;
        self.agent_seen().await;
        Ok(snapshot)
    }

    pub async fn car_park_push(&self, mut snapshot: CarParkSnapshot) -> Result<UpsertCounts, GatewayError> {
        for plate in &mut snapshot.plates {
            plate.plate = normalize_plate(&plate.plate);
            if plate.plate.is_empty() {
                return Err(GatewayError::Invalid("plate number must not be empty".to_string()));
            }
        }
        if snapshot.persons.iter().any(|p| p.id.trim().is_empty()) {
            return Err(GatewayError::Invalid("person id must not be empty".to_string()));
        }
        let counts = self
            .store
            .lock()
            .await
            .upsert_snapshot(&snapshot, local_now())?;
        self.agent_seen().await;
        info!(persons = counts.persons, plates = counts.plates, "site snapshot applied");
        Ok(counts)
    }

    pub async fn client_alive(&self, alive: &ClientAlive) {
        self.agent_seen().await;
        if let Some(alert) = alive_alert(alive) {
            warn!(status = ?alive.status, "site agent reports abnormal status");
            let wecom = self.wecom.clone();
            tokio::spawn(async move {
                wecom.notify_admins(&alert).await;
            });
        }
    }
}
