//! Projection of approval forms into a canonical renewal record.
//!
//! Controls are matched by their human-readable title first, since control
//! ids change between template revisions; configured ids are a fallback.

use std::collections::BTreeMap;

use chrono::DateTime;
use parkgate_contracts::{ApprovalRecord, FormItem, FormValue, PlateClass};
use serde_json::Value;

use crate::command::normalize_plate;

pub const FIELD_PLATE: &str = "plate";
pub const FIELD_OWNER: &str = "owner";
pub const FIELD_CLASS: &str = "class";
pub const FIELD_MONTHS: &str = "months";
pub const FIELD_MONEY: &str = "money";

/// Title fragments per canonical field, checked in order.
const TITLE_HINTS: &[(&str, &[&str])] = &[
    (FIELD_PLATE, &["车牌"]),
    (FIELD_OWNER, &["车主", "姓名", "业主"]),
    (FIELD_CLASS, &["车辆类型", "类型", "类别"]),
    (FIELD_MONTHS, &["月数", "续期", "时长", "月份"]),
    (FIELD_MONEY, &["金额", "费用", "缴费"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RenewalForm {
    pub plate: String,
    pub owner: String,
    pub class_label: String,
    pub months: u32,
    pub money: String,
}

impl RenewalForm {
    pub fn class(&self) -> PlateClass {
        class_from_label(&self.class_label)
    }
}

pub fn class_from_label(label: &str) -> PlateClass {
    if label.contains("租户") || label.contains("外部") {
        PlateClass::TenantOrExternal
    } else if label.contains("二车") {
        PlateClass::OwnerSecondary
    } else {
        PlateClass::OwnerPrimary
    }
}

fn localized_text(v: &Value) -> String {
    let Some(list) = v.as_array() else {
        return v.as_str().unwrap_or_default().to_string();
    };
    list.iter()
        .find(|t| t.get("lang").and_then(Value::as_str) == Some("zh_CN"))
        .or_else(|| list.first())
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn str_field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn project_value(control: &str, value: &Value) -> FormValue {
    match control {
        "Text" | "Textarea" => FormValue::Text(str_field(value, "text")),
        "Selector" => {
            let first = value
                .pointer("/selector/options/0")
                .cloned()
                .unwrap_or(Value::Null);
            FormValue::Selector {
                key: str_field(&first, "key"),
                text: first.get("value").map(localized_text).unwrap_or_default(),
            }
        }
        "Number" => FormValue::Number(str_field(value, "new_number")),
        "Money" => FormValue::Money(str_field(value, "new_money")),
        "Date" => {
            let raw = value
                .pointer("/date/s_timestamp")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            let text = raw
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or(raw);
            FormValue::Date(text)
        }
        _ => FormValue::Unsupported,
    }
}

/// Parses the `info` object of an approval-detail response.
pub fn parse_approval_detail(info: &Value) -> Result<ApprovalRecord, String> {
    let sp_no = str_field(info, "sp_no");
    if sp_no.is_empty() {
        return Err("approval detail missing sp_no".to_string());
    }
    let items = info
        .pointer("/apply_data/contents")
        .and_then(Value::as_array)
        .map(|contents| {
            contents
                .iter()
                .map(|c| {
                    let control = str_field(c, "control");
                    FormItem {
                        id: str_field(c, "id"),
                        title: c.get("title").map(localized_text).unwrap_or_default(),
                        value: project_value(&control, c.get("value").unwrap_or(&Value::Null)),
                        control,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(ApprovalRecord {
        sp_no,
        apply_time: info.get("apply_time").and_then(Value::as_i64).unwrap_or(0),
        applicant: info
            .pointer("/applyer/userid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: info.get("sp_status").and_then(Value::as_i64).unwrap_or(0),
        items,
    })
}

/// Controls of an approval template as (id, title, control type).
pub fn parse_template_controls(detail: &Value) -> Vec<(String, String, String)> {
    detail
        .pointer("/template_content/controls")
        .and_then(Value::as_array)
        .map(|controls| {
            controls
                .iter()
                .filter_map(|c| c.get("property"))
                .map(|p| {
                    (
                        str_field(p, "id"),
                        p.get("title").map(localized_text).unwrap_or_default(),
                        str_field(p, "control"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Control id for a canonical field, matched against template control titles.
pub fn control_id_for_title<'a>(controls: &'a [(String, String, String)], field: &str) -> Option<&'a str> {
    let hints = TITLE_HINTS.iter().find(|(f, _)| *f == field)?.1;
    hints.iter().find_map(|hint| {
        controls
            .iter()
            .find(|(_, title, _)| title.contains(hint))
            .map(|(id, _, _)| id.as_str())
    })
}

fn find_item<'a>(
    items: &'a [FormItem],
    field: &str,
    control_ids: &BTreeMap<String, String>,
    taken: &[&str],
) -> Option<&'a FormItem> {
    let hints = TITLE_HINTS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, h)| *h)
        .unwrap_or_default();
    let by_title = hints.iter().find_map(|hint| {
        items
            .iter()
            .filter(|i| !taken.contains(&i.id.as_str()))
            .find(|i| i.title.contains(hint))
    });
    by_title.or_else(|| {
        let id = control_ids.get(field)?;
        items.iter().find(|i| &i.id == id)
    })
}

fn parse_months(raw: &str) -> Option<u32> {
    let v: f64 = raw.trim().parse().ok()?;
    let rounded = v.round();
    (rounded >= 1.0 && rounded <= f64::from(u32::MAX)).then_some(rounded as u32)
}

pub fn extract_renewal_form(
    record: &ApprovalRecord,
    control_ids: &BTreeMap<String, String>,
) -> Result<RenewalForm, String> {
    let mut taken: Vec<&str> = Vec::new();
    let mut text_of = |field: &str| -> Option<String> {
        let item = find_item(&record.items, field, control_ids, &taken)?;
        taken.push(item.id.as_str());
        item.value.as_text().map(|v| v.trim().to_string())
    };

    let plate = text_of(FIELD_PLATE)
        .map(|v| normalize_plate(&v))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("审批单 {} 缺少车牌号", record.sp_no))?;
    let owner = text_of(FIELD_OWNER).unwrap_or_default();
    let class_label = text_of(FIELD_CLASS).unwrap_or_default();
    let months = text_of(FIELD_MONTHS)
        .as_deref()
        .and_then(parse_months)
        .ok_or_else(|| format!("审批单 {} 续期月数无效", record.sp_no))?;
    let money = text_of(FIELD_MONEY)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "0".to_string());

    Ok(RenewalForm {
        plate,
        owner,
        class_label,
        months,
        money,
    })
}
