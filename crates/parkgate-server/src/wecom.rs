//! Outbound calls to the WeChat Work API: messages, approvals and tokens.

use std::path::PathBuf;
use std::time::Duration;

use parkgate_config::{Receivers, WeCom};
use parkgate_contracts::ApprovalRecord;
use parkgate_kernel::parse_approval_detail;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::token::TokenCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Ok,
    /// Token expired or invalid; refresh once and retry.
    TokenInvalid,
    /// Frequency limits and "system busy"; back off and retry.
    RateLimited,
    Permanent,
}

pub fn classify(errcode: i64) -> ErrorClass {
    match errcode {
        0 => ErrorClass::Ok,
        40014 | 41001 | 42001 => ErrorClass::TokenInvalid,
        -1 | 45009 | 45011 | 45033 => ErrorClass::RateLimited,
        _ => ErrorClass::Permanent,
    }
}

/// Message addressees, joined with `|` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub users: Vec<String>,
    pub parties: Vec<String>,
    pub tags: Vec<String>,
}

impl Recipients {
    pub fn user(id: &str) -> Self {
        Self {
            users: vec![id.to_string()],
            ..Self::default()
        }
    }

    pub fn from_receivers(r: &Receivers) -> Self {
        Self {
            users: r.touser.clone(),
            parties: r.toparty.clone(),
            tags: r.totag.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.parties.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub picurl: String,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Text(String),
    Markdown(String),
    TemplateCard(Value),
    Image { media_id: String },
    Voice { media_id: String },
    Video { media_id: String, title: String, description: String },
    File { media_id: String },
    News(Vec<Article>),
}

impl MessageBody {
    fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "text",
            MessageBody::Markdown(_) => "markdown",
            MessageBody::TemplateCard(_) => "template_card",
            MessageBody::Image { .. } => "image",
            MessageBody::Voice { .. } => "voice",
            MessageBody::Video { .. } => "video",
            MessageBody::File { .. } => "file",
            MessageBody::News(_) => "news",
        }
    }

    fn payload(&self) -> Value {
        match self {
            MessageBody::Text(content) | MessageBody::Markdown(content) => json!({ "content": content }),
            MessageBody::TemplateCard(card) => card.clone(),
            MessageBody::Image { media_id }
            | MessageBody::Voice { media_id }
            | MessageBody::File { media_id } => json!({ "media_id": media_id }),
            MessageBody::Video {
                media_id,
                title,
                description,
            } => json!({ "media_id": media_id, "title": title, "description": description }),
            MessageBody::News(articles) => json!({ "articles": articles }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    pub msgid: String,
    pub invalid_users: String,
}

/// One control value in an approval application.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalControl {
    pub control: String,
    pub id: String,
    pub value: Value,
}

impl ApprovalControl {
    pub fn text(id: &str, text: &str) -> Self {
        Self {
            control: "Text".to_string(),
            id: id.to_string(),
            value: json!({ "text": text }),
        }
    }

    pub fn number(id: &str, number: u32) -> Self {
        Self {
            control: "Number".to_string(),
            id: id.to_string(),
            value: json!({ "new_number": number.to_string() }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateApproval {
    pub creator: String,
    pub template_id: String,
    pub approvers: Vec<String>,
    pub contents: Vec<ApprovalControl>,
    pub summary: Vec<String>,
}

impl CreateApproval {
    fn to_json(&self) -> Value {
        json!({
            "creator_userid": self.creator,
            "template_id": self.template_id,
            "use_template_approver": if self.approvers.is_empty() { 1 } else { 0 },
            "approver": [{ "attr": 2, "userid": self.approvers }],
            "notify_type": 1,
            "apply_data": { "contents": self.contents },
            "summary_list": self.summary.iter().map(|line| json!({
                "summary_info": [{ "text": line, "lang": "zh_CN" }]
            })).collect::<Vec<_>>(),
        })
    }
}

pub struct WeComClient {
    http: Client,
    api_base: String,
    corp_id: String,
    corp_secret: String,
    agent_id: i64,
    default_expires_in: i64,
    retry_times: usize,
    retry_interval: Duration,
    default_receivers: Recipients,
    tokens: TokenCache,
}

impl WeComClient {
    pub fn new(cfg: &WeCom) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| GatewayError::Invalid(e.to_string()))?;
        Ok(Self {
            http,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            corp_id: cfg.corp_id.clone(),
            corp_secret: cfg.corp_secret.clone(),
            agent_id: cfg.agent_id,
            default_expires_in: cfg.access_token_expire_time,
            retry_times: cfg.message_retry_times.max(1),
            retry_interval: Duration::from_secs(cfg.message_retry_interval),
            default_receivers: Recipients::from_receivers(&cfg.default_message_receiver),
            tokens: TokenCache::new(cfg.token_cache_path.as_ref().map(PathBuf::from)),
        })
    }

    pub async fn access_token(&self) -> Result<String, GatewayError> {
        self.tokens.acquire_with(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> Result<(String, i64), GatewayError> {
        let url = format!("{}/gettoken", self.api_base);
        let response = self
            .http
            .get(&url)
            .query(&[("corpid", &self.corp_id), ("corpsecret", &self.corp_secret)])
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("gettoken: {e}")))?;
        let body = decode_body(response).await?;
        let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
        if errcode != 0 {
            return Err(GatewayError::Platform {
                code: errcode,
                msg: errmsg(&body),
            });
        }
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Platform {
                code: -2,
                msg: "gettoken response without access_token".to_string(),
            })?;
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(self.default_expires_in);
        Ok((token.to_string(), expires_in))
    }

    /// Authenticated POST with the token/rate-limit retry policy applied.
    async fn call(&self, path: &str, body: &Value) -> Result<Value, GatewayError> {
        let url = format!("{}/{}", self.api_base, path);
        let mut refreshed = false;
        let mut attempt = 0;
        loop {
            let token = self.access_token().await?;
            let outcome = self
                .http
                .post(&url)
                .query(&[("access_token", &token)])
                .json(body)
                .send()
                .await
                .map_err(|e| GatewayError::Transient(format!("{path}: {e}")));
            let decoded = match outcome {
                Ok(response) => decode_body(response).await,
                Err(e) => Err(e),
            };
            let retryable = match decoded {
                Ok(reply) => {
                    let errcode = reply.get("errcode").and_then(Value::as_i64).unwrap_or(0);
                    match classify(errcode) {
                        ErrorClass::Ok => return Ok(reply),
                        ErrorClass::TokenInvalid if !refreshed => {
                            warn!(path, errcode, "access token rejected, refreshing");
                            self.tokens.force_refresh(&token).await;
                            refreshed = true;
                            continue;
                        }
                        ErrorClass::TokenInvalid => return Err(GatewayError::TokenExpired(errcode)),
                        ErrorClass::RateLimited => GatewayError::RateLimited(errcode),
                        ErrorClass::Permanent => {
                            return Err(GatewayError::Platform {
                                code: errcode,
                                msg: errmsg(&reply),
                            })
                        }
                    }
                }
                Err(e @ GatewayError::Transient(_)) => e,
                Err(e) => return Err(e),
            };

            attempt += 1;
            if attempt >= self.retry_times {
                warn!(path, attempt, error = %retryable, "giving up after retries");
                return Err(retryable);
            }
            debug!(path, attempt, error = %retryable, "retrying platform call");
            if self.retry_interval > Duration::ZERO {
                sleep(self.retry_interval).await;
            }
        }
    }

    pub async fn send_message(
        &self,
        to: &Recipients,
        body: &MessageBody,
        safe: bool,
    ) -> Result<SendReceipt, GatewayError> {
        if to.is_empty() {
            return Err(GatewayError::Invalid("message without recipients".to_string()));
        }
        let kind = body.kind();
        let mut request = json!({
            "touser": to.users.join("|"),
            "toparty": to.parties.join("|"),
            "totag": to.tags.join("|"),
            "msgtype": kind,
            "agentid": self.agent_id,
            "safe": i32::from(safe),
        });
        request[kind] = body.payload();
        let reply = self.call("message/send", &request).await?;
        Ok(SendReceipt {
            msgid: reply
                .get("msgid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            invalid_users: reply
                .get("invaliduser")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub async fn send_text(&self, to: &Recipients, content: &str) -> Result<SendReceipt, GatewayError> {
        self.send_message(to, &MessageBody::Text(content.to_string()), false)
            .await
    }


    /// Text message to the configured default receivers. Failures are logged.
    pub async fn notify_admins(&self, content: &str) -> bool {
        match self.send_text(&self.default_receivers, content).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "admin notification failed");
                false
            }
        }
    }

    pub fn default_receivers(&self) -> &Recipients {
        &self.default_receivers
    }

    /// Opens an approval ticket and returns its sp_no.
    pub async fn create_approval(&self, req: &CreateApproval) -> Result<String, GatewayError> {
        let reply = self.call("oa/applyevent", &req.to_json()).await?;
        reply
            .get("sp_no")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Platform {
                code: -2,
                msg: "applyevent response without sp_no".to_string(),
            })
    }

    pub async fn get_approval_detail(&self, sp_no: &str) -> Result<ApprovalRecord, GatewayError> {
        let reply = self
            .call("oa/getapprovaldetail", &json!({ "sp_no": sp_no }))
            .await?;
        let info = reply.get("info").ok_or_else(|| GatewayError::Platform {
            code: -2,
            msg: "approval detail without info".to_string(),
        })?;
        parse_approval_detail(info).map_err(|msg| GatewayError::Platform { code: -2, msg })
    }

    pub async fn get_template_detail(&self, template_id: &str) -> Result<Value, GatewayError> {
        self.call("oa/gettemplatedetail", &json!({ "template_id": template_id }))
            .await
    }
}

async fn decode_body(response: reqwest::Response) -> Result<Value, GatewayError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(GatewayError::Transient(format!("platform http {status}")));
    }
    if !status.is_success() {
        return Err(GatewayError::Platform {
            code: i64::from(status.as_u16()),
            msg: format!("platform http {status}"),
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| GatewayError::Transient(format!("platform body: {e}")))
}

fn errmsg(body: &Value) -> String {
    body.get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
