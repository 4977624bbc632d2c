use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Wall-clock layout shared by the gateway store and the on-site agent.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIME_FORMAT).to_string()
}

/// Accepts the agent's layouts: full timestamp, ISO `T` separator, or a bare date
/// (taken as end of day).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for layout in [
        TIME_FORMAT,
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S",
    ] {
        if let Ok(v) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(v);
        }
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
}

mod ts {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

mod ts_opt {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_str(&super::format_timestamp(v)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => super::parse_timestamp(v)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {v}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlateClass {
    OwnerPrimary,
    OwnerSecondary,
    TenantOrExternal,
}

impl PlateClass {
    pub fn as_str(self) -> &'static str {
        match self {
            PlateClass::OwnerPrimary => "owner_primary",
            PlateClass::OwnerSecondary => "owner_secondary",
            PlateClass::TenantOrExternal => "tenant_or_external",
        }
    }

    /// Display label used in replies and approval forms.
    pub fn label(self) -> &'static str {
        match self {
            PlateClass::OwnerPrimary => "业主首车",
            PlateClass::OwnerSecondary => "业主二车",
            PlateClass::TenantOrExternal => "租户/外部车辆",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "owner_primary" => Some(PlateClass::OwnerPrimary),
            "owner_secondary" => Some(PlateClass::OwnerSecondary),
            "tenant_or_external" => Some(PlateClass::TenantOrExternal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Pending,
    /// Rename request awaiting the agent; the new plate travels in the remark.
    Change,
    Changed,
    Complete,
    Failed,
}

impl TicketState {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketState::Pending => "pending",
            TicketState::Change => "change",
            TicketState::Changed => "changed",
            TicketState::Complete => "complete",
            TicketState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TicketState::Pending),
            "change" => Some(TicketState::Change),
            "changed" => Some(TicketState::Changed),
            "complete" => Some(TicketState::Complete),
            "failed" => Some(TicketState::Failed),
            _ => None,
        }
    }

    /// Open tickets are the ones the agent still has to apply.
    pub fn is_open(self) -> bool {
        matches!(self, TicketState::Pending | TicketState::Change)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    pub fn can_transition_to(self, next: TicketState) -> bool {
        match self {
            TicketState::Pending => matches!(
                next,
                TicketState::Changed | TicketState::Complete | TicketState::Failed
            ),
            TicketState::Change => matches!(
                next,
                TicketState::Changed | TicketState::Complete | TicketState::Failed
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub slot_count: i64,
    #[serde(default)]
    pub national_id: String,
    #[serde(default)]
    pub external_ref: String,
    #[serde(default)]
    pub external_ref2: String,
    #[serde(default)]
    pub wecom_userid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plate {
    pub plate: String,
    pub person_id: String,
    pub class: PlateClass,
    #[serde(default, with = "ts_opt")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, with = "ts_opt")]
    pub end_time: Option<NaiveDateTime>,
    #[serde(rename = "pRemark", default)]
    pub remark: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, with = "ts_opt")]
    pub modified_at: Option<NaiveDateTime>,
    /// Cleared whenever the gateway changes the row; set again by the next agent push.
    #[serde(default)]
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenewalTicket {
    pub id: i64,
    #[serde(rename = "owner_name")]
    pub owner: String,
    #[serde(rename = "car_number")]
    pub plate: String,
    pub months: u32,
    #[serde(with = "ts")]
    pub created_at: NaiveDateTime,
    #[serde(rename = "status")]
    pub state: TicketState,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_sp_no: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeRecord {
    pub id: i64,
    pub plate: String,
    pub owner: String,
    /// Opaque decimal carried through as text.
    pub money: String,
    #[serde(with = "ts")]
    pub created_at: NaiveDateTime,
    pub remark: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_sp_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    Selector { key: String, text: String },
    Number(String),
    Date(String),
    Money(String),
    Unsupported,
}

impl FormValue {
    /// Flattened text view; selectors prefer the option label.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormValue::Text(v) | FormValue::Number(v) | FormValue::Date(v) | FormValue::Money(v) => {
                Some(v.as_str())
            }
            FormValue::Selector { key, text } => {
                if text.is_empty() {
                    Some(key.as_str())
                } else {
                    Some(text.as_str())
                }
            }
            FormValue::Unsupported => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormItem {
    pub control: String,
    pub id: String,
    pub title: String,
    pub value: FormValue,
}

/// Read-only projection of an approval fetched from the messaging platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRecord {
    pub sp_no: String,
    pub apply_time: i64,
    pub applicant: String,
    pub status: i64,
    pub items: Vec<FormItem>,
}

/// Platform status code for an approved form.
pub const APPROVAL_STATUS_APPROVED: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiReply<T> {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub msg: String,
}

impl<T> ApiReply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 0,
            data: Some(data),
            msg: "ok".to_string(),
        }
    }
}

impl ApiReply<()> {
    pub fn message(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewUpdate {
    pub car_number: String,
    pub status: TicketState,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarParkSnapshot {
    #[serde(default)]
    pub persons: Vec<Person>,
    #[serde(default)]
    pub plates: Vec<Plate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CarParkQuery {
    pub car_number: Option<String>,
    pub owner_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarParkRecord {
    pub plate: Plate,
    pub person: Option<Person>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientAlive {
    pub status: Option<String>,
    pub process_id: Option<String>,
    pub memory_usage: Option<String>,
    pub cpu_usage: Option<String>,
}
