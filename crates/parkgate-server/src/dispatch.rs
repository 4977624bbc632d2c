//! Inbound callback handling: envelope verification, routing and replies.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::AppState;
use parkgate_kernel::{signature, verify_signature};

/// Body returned whenever there is nothing to say back.
pub const ACK: &str = "success";

pub const WELCOME_TEXT: &str = "欢迎使用停车场助手！\n\
发送“绑定 姓名 手机号”关联您的车辆，发送“帮助”查看全部指令。";

pub const UNSUPPORTED_TEXT: &str = "暂不支持该类型消息，请发送文字指令，发送“帮助”查看用法。";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub msg_signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
}

impl CallbackQuery {
    fn parts(&self) -> Result<(&str, &str, &str), GatewayError> {
        match (&self.msg_signature, &self.timestamp, &self.nonce) {
            (Some(sig), Some(ts), Some(nonce)) => Ok((sig.as_str(), ts.as_str(), nonce.as_str())),
            _ => Err(GatewayError::AuthenticationFailed),
        }
    }
}

/// Decrypted inbound message fields the gateway routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub to_user: String,
    pub from_user: String,
    pub msg_type: String,
    pub content: String,
    pub event: String,
    pub event_key: String,
    pub agent_id: String,
    pub sp_no: String,
    pub sp_status: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Command(String),
    Approval { sp_no: String, status: i64 },
    Reply(String),
    Ignore,
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .map(|n| n.text().unwrap_or_default().trim().to_string())
}

fn parse_xml(raw: &str) -> Result<roxmltree::Document<'_>, GatewayError> {
    roxmltree::Document::parse(raw).map_err(|e| GatewayError::EnvelopeCorrupt(format!("xml: {e}")))
}

/// Pulls `<Encrypt>` out of the outer callback envelope.
pub fn outer_encrypt(raw: &str) -> Result<String, GatewayError> {
    let doc = parse_xml(raw)?;
    child_text(doc.root_element(), "Encrypt")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::EnvelopeCorrupt("missing Encrypt".to_string()))
}

pub fn parse_inbound(raw: &str) -> Result<InboundMessage, GatewayError> {
    let doc = parse_xml(raw)?;
    let root = doc.root_element();
    let field = |name: &str| child_text(root, name).unwrap_or_default();

    let mut msg = InboundMessage {
        to_user: field("ToUserName"),
        from_user: field("FromUserName"),
        msg_type: field("MsgType"),
        content: field("Content"),
        event: field("Event"),
        event_key: field("EventKey"),
        agent_id: field("AgentID"),
        ..InboundMessage::default()
    };
    // Top-level status only; SpRecord children carry per-approver statuses.
    if let Some(info) = root.children().find(|n| n.has_tag_name("ApprovalInfo")) {
        msg.sp_no = child_text(info, "SpNo")
            .or_else(|| child_text(info, "ThirdNo"))
            .unwrap_or_default();
        msg.sp_status = child_text(info, "SpStatus")
            .or_else(|| child_text(info, "OpenSpStatus"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
    }
    Ok(msg)
}

pub fn route(msg: &InboundMessage) -> Route {
    match msg.msg_type.as_str() {
        "text" => Route::Command(msg.content.clone()),
        "event" => match msg.event.as_str() {
            "sys_approval_change" | "open_approval_change" if !msg.sp_no.is_empty() => Route::Approval {
                sp_no: msg.sp_no.clone(),
                status: msg.sp_status,
            },
            "subscribe" => Route::Reply(WELCOME_TEXT.to_string()),
            "click" if !msg.event_key.trim().is_empty() => Route::Command(msg.event_key.clone()),
            _ => Route::Ignore,
        },
        _ => Route::Reply(UNSUPPORTED_TEXT.to_string()),
    }
}

fn cdata(v: &str) -> String {
    format!("<![CDATA[{}]]>", v.replace("]]>", "]]]]><![CDATA[>"))
}

pub fn reply_xml(to_user: &str, from_user: &str, created: i64, content: &str, agent_id: i64) -> String {
    format!(
        "<xml><ToUserName>{}</ToUserName><FromUserName>{}</FromUserName>\
         <CreateTime>{created}</CreateTime><MsgType>{}</MsgType><Content>{}</Content>\
         <AgentID>{agent_id}</AgentID></xml>",
        cdata(to_user),
        cdata(from_user),
        cdata("text"),
        cdata(content)
    )
}

pub fn envelope_xml(encrypt: &str, signature: &str, timestamp: &str, nonce: &str) -> String {
    format!(
        "<xml><Encrypt>{}</Encrypt><MsgSignature>{}</MsgSignature>\
         <TimeStamp>{timestamp}</TimeStamp><Nonce>{}</Nonce></xml>",
        cdata(encrypt),
        cdata(signature),
        cdata(nonce)
    )
}

fn fresh_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

impl AppState {
    /// URL-verification handshake: returns the decrypted echo string.
    pub fn verify_url(&self, q: &CallbackQuery) -> Result<String, GatewayError> {
        let (sig, ts, nonce) = q.parts()?;
        let echo = q
            .echostr
            .as_deref()
            .ok_or_else(|| GatewayError::Invalid("missing echostr".to_string()))?;
        verify_signature(&self.cfg.wecom.token, sig, ts, nonce, echo)?;
        let plain = self.crypt.decrypt(echo)?;
        String::from_utf8(plain).map_err(|_| GatewayError::EnvelopeCorrupt("echo is not utf-8".to_string()))
    }

    /// Verifies and decrypts a callback body, then routes it.
    pub fn open_inbound(&self, q: &CallbackQuery, body: &[u8]) -> Result<InboundMessage, GatewayError> {
        let (sig, ts, nonce) = q.parts()?;
        let body = std::str::from_utf8(body)
            .map_err(|_| GatewayError::EnvelopeCorrupt("body is not utf-8".to_string()))?;
        let encrypt = outer_encrypt(body)?;
        verify_signature(&self.cfg.wecom.token, sig, ts, nonce, &encrypt)?;
        let plain = self.crypt.decrypt(&encrypt)?;
        let inner = String::from_utf8(plain)
            .map_err(|_| GatewayError::EnvelopeCorrupt("message is not utf-8".to_string()))?;
        parse_inbound(&inner)
    }

    /// Encrypts `content` as a passive text reply to `msg`.
    pub fn seal_reply(&self, msg: &InboundMessage, content: &str) -> Result<String, GatewayError> {
        let now = Utc::now().timestamp();
        let inner = reply_xml(&msg.from_user, &msg.to_user, now, content, self.cfg.wecom.agent_id);
        let encrypt = self.crypt.encrypt(inner.as_bytes())?;
        let timestamp = now.to_string();
        let nonce = fresh_nonce();
        let sig = signature(&self.cfg.wecom.token, &timestamp, &nonce, &encrypt);
        Ok(envelope_xml(&encrypt, &sig, &timestamp, &nonce))
    }

    /// Handles one callback POST. `None` means acknowledge with [`ACK`].
    /// Errors are already logged; the platform still gets an acknowledgement.
    pub async fn handle_inbound(&self, q: &CallbackQuery, body: &[u8]) -> Option<String> {
        let msg = match self.open_inbound(q, body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "rejected inbound callback");
                return None;
            }
        };
        debug!(from = %msg.from_user, msg_type = %msg.msg_type, event = %msg.event, "inbound message");

        let reply = match route(&msg) {
            Route::Command(text) => self.run_command(&text, &msg.from_user).await,
            Route::Approval { sp_no, status } => {
                info!(sp_no = %sp_no, status, "approval event received");
                let state = self.clone();
                tokio::spawn(async move {
                    state.process_approval(&sp_no, status).await;
                });
                None
            }
            Route::Reply(text) => Some(text),
            Route::Ignore => None,
        }?;

        match self.seal_reply(&msg, &reply) {
            Ok(xml) => Some(xml),
            Err(e) => {
                warn!(error = %e, "reply encryption failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_message() {
        let raw = "<xml><ToUserName><![CDATA[ww0e92b0a70b5f5bb6]]></ToUserName>\
            <FromUserName><![CDATA[zhangsan]]></FromUserName><CreateTime>1348831860</CreateTime>\
            <MsgType><![CDATA[text]]></MsgType><Content><![CDATA[查询 川A12345]]></Content>\
            <MsgId>1234567890123456</MsgId><AgentID>1000002</AgentID></xml>";
        let msg = parse_inbound(raw).unwrap();
        assert_eq!(msg.from_user, "zhangsan");
        assert_eq!(msg.agent_id, "1000002");
        assert_eq!(route(&msg), Route::Command("查询 川A12345".to_string()));
    }

    #[test]
    fn approval_status_ignores_approver_records() {
        let raw = "<xml><ToUserName><![CDATA[corp]]></ToUserName><FromUserName><![CDATA[sys]]></FromUserName>\
            <MsgType><![CDATA[event]]></MsgType><Event><![CDATA[sys_approval_change]]></Event>\
            <ApprovalInfo><SpNo>202506010001</SpNo><SpName><![CDATA[车辆续期]]></SpName><SpStatus>2</SpStatus>\
            <SpRecord><SpStatus>1</SpStatus><Details><SpStatus>1</SpStatus></Details></SpRecord></ApprovalInfo></xml>";
        let msg = parse_inbound(raw).unwrap();
        assert_eq!(
            route(&msg),
            Route::Approval {
                sp_no: "202506010001".to_string(),
                status: 2
            }
        );
    }

    #[test]
    fn open_approval_fields_are_accepted() {
        let raw = "<xml><MsgType>event</MsgType><Event>open_approval_change</Event>\
            <ApprovalInfo><ThirdNo>T-9</ThirdNo><OpenSpStatus>2</OpenSpStatus></ApprovalInfo></xml>";
        let msg = parse_inbound(raw).unwrap();
        assert_eq!(msg.sp_no, "T-9");
        assert_eq!(msg.sp_status, 2);
    }

    #[test]
    fn events_and_other_kinds_route() {
        let event = |name: &str, key: &str| InboundMessage {
            msg_type: "event".to_string(),
            event: name.to_string(),
            event_key: key.to_string(),
            ..InboundMessage::default()
        };
        assert_eq!(route(&event("subscribe", "")), Route::Reply(WELCOME_TEXT.to_string()));
        assert_eq!(route(&event("click", "帮助")), Route::Command("帮助".to_string()));
        assert_eq!(route(&event("enter_agent", "")), Route::Ignore);
        let image = InboundMessage {
            msg_type: "image".to_string(),
            ..InboundMessage::default()
        };
        assert_eq!(route(&image), Route::Reply(UNSUPPORTED_TEXT.to_string()));
    }

    #[test]
    fn reply_escapes_cdata_terminator() {
        let xml = reply_xml("u", "corp", 1, "a]]>b", 1000002);
        let doc = roxmltree::Document::parse(&xml).unwrap();
        let content = doc
            .root_element()
            .children()
            .find(|n| n.has_tag_name("Content"))
            .unwrap();
        let text: String = content.children().filter_map(|n| n.text()).collect();
        assert_eq!(text, "a]]>b");
    }

    #[test]
    fn envelope_without_encrypt_is_corrupt() {
        assert!(matches!(
            outer_encrypt("<xml><ToUserName>x</ToUserName></xml>"),
            Err(GatewayError::EnvelopeCorrupt(_))
        ));
        assert!(matches!(outer_encrypt("not xml"), Err(GatewayError::EnvelopeCorrupt(_))));
    }
}
