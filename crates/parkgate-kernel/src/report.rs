//! Human-readable replies and the daily expiry partition.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use parkgate_contracts::{FeeRecord, Person, Plate, PlateClass};

use crate::calendar::{remaining_days, ExpiryStatus};

fn date_only(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d").to_string()
}

fn days_text(days: i64) -> String {
    if days >= 0 {
        format!("{days}天")
    } else {
        format!("已过期{}天", -days)
    }
}

pub fn format_single(plate: &Plate, person: Option<&Person>, now: NaiveDateTime) -> String {
    let mut lines = vec![
        format!("车牌号：{}", plate.plate),
        format!("车主：{}", person.map(|p| p.name.as_str()).unwrap_or("未知")),
        format!("车辆类型：{}", plate.class.label()),
    ];
    match plate.end_time {
        Some(end) => {
            lines.push(format!("到期时间：{}", date_only(&end)));
            lines.push(format!("剩余天数：{}", days_text(remaining_days(end, now))));
            lines.push(format!("状态：{}", ExpiryStatus::of(end, now).label()));
        }
        None => lines.push("到期时间：未设置".to_string()),
    }
    if let Some(phone) = person.map(|p| p.phone.trim()).filter(|v| !v.is_empty()) {
        lines.push(format!("联系电话：{phone}"));
    }
    if !plate.remark.trim().is_empty() {
        lines.push(format!("备注：{}", plate.remark.trim()));
    }
    lines.join("\n")
}

pub fn format_multi(rows: &[(Plate, Option<Person>)], limit: usize, now: NaiveDateTime) -> String {
    let mut out = format!("找到{}条记录：", rows.len());
    for (idx, (plate, person)) in rows.iter().take(limit).enumerate() {
        let owner = person.as_ref().map(|p| p.name.as_str()).unwrap_or("未知");
        let tail = match plate.end_time {
            Some(end) => format!(
                "{}（{}）",
                date_only(&end),
                days_text(remaining_days(end, now))
            ),
            None => "未设置".to_string(),
        };
        out.push_str(&format!("\n{}. {} {} {}", idx + 1, plate.plate, owner, tail));
    }
    if rows.len() > limit {
        out.push_str(&format!("\n仅显示前{limit}条，请输入完整车牌查询"));
    }
    out
}

pub fn format_records(records: &[FeeRecord]) -> String {
    if records.is_empty() {
        return "最近30天没有续费记录".to_string();
    }
    let mut out = String::from("最近30天续费记录：");
    for (idx, r) in records.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} {} 金额{} {}",
            idx + 1,
            date_only(&r.created_at),
            r.plate,
            r.money,
            r.remark
        ));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryFinding {
    pub plate: String,
    pub owner: String,
    pub user_id: Option<String>,
    pub class: PlateClass,
    pub end_time: NaiveDateTime,
    pub days: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryScan {
    pub soon: Vec<ExpiryFinding>,
    pub expired: Vec<ExpiryFinding>,
}

impl ExpiryScan {
    pub fn is_empty(&self) -> bool {
        self.soon.is_empty() && self.expired.is_empty()
    }
}

/// Soon: end in (now, now + soon_days]. Recently expired: end in [now - expired_days, now].
pub fn partition_expiring(
    rows: &[(Plate, Option<Person>)],
    now: NaiveDateTime,
    soon_days: i64,
    expired_days: i64,
) -> ExpiryScan {
    let window = |days: i64| Duration::try_days(days).unwrap_or(Duration::MAX);
    let soon_limit = now
        .checked_add_signed(window(soon_days))
        .unwrap_or(NaiveDateTime::MAX);
    let expired_floor = now
        .checked_sub_signed(window(expired_days))
        .unwrap_or(NaiveDateTime::MIN);
    let mut scan = ExpiryScan::default();
    for (plate, person) in rows {
        if plate.deleted {
            continue;
        }
        let Some(end) = plate.end_time else {
            continue;
        };
        let finding = || ExpiryFinding {
            plate: plate.plate.clone(),
            owner: person.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
            user_id: person.as_ref().and_then(|p| p.wecom_userid.clone()),
            class: plate.class,
            end_time: end,
            days: remaining_days(end, now),
        };
        if end > now && end <= soon_limit {
            scan.soon.push(finding());
        } else if end >= expired_floor && end <= now {
            scan.expired.push(finding());
        }
    }
    scan.soon.sort_by_key(|f| f.end_time);
    scan.expired.sort_by_key(|f| f.end_time);
    scan
}

/// Findings per bound user id, soon and expired kept apart.
pub fn group_by_user(scan: &ExpiryScan) -> BTreeMap<String, ExpiryScan> {
    let mut out: BTreeMap<String, ExpiryScan> = BTreeMap::new();
    for f in &scan.soon {
        if let Some(uid) = &f.user_id {
            out.entry(uid.clone()).or_default().soon.push(f.clone());
        }
    }
    for f in &scan.expired {
        if let Some(uid) = &f.user_id {
            out.entry(uid.clone()).or_default().expired.push(f.clone());
        }
    }
    out
}

fn finding_line(f: &ExpiryFinding) -> String {
    if f.days >= 0 {
        format!(
            "{} {} {} 到期{}（剩余{}天）",
            f.plate,
            f.owner,
            f.class.label(),
            date_only(&f.end_time),
            f.days
        )
    } else {
        format!(
            "{} {} {} 到期{}（已过期{}天）",
            f.plate,
            f.owner,
            f.class.label(),
            date_only(&f.end_time),
            -f.days
        )
    }
}

pub fn format_user_notice(scan: &ExpiryScan) -> String {
    let mut out = String::from("【停车到期提醒】");
    if !scan.soon.is_empty() {
        out.push_str("\n以下车辆即将到期：");
        for f in &scan.soon {
            out.push_str(&format!("\n· {}", finding_line(f)));
        }
    }
    if !scan.expired.is_empty() {
        out.push_str("\n以下车辆已过期：");
        for f in &scan.expired {
            out.push_str(&format!("\n· {}", finding_line(f)));
        }
    }
    out.push_str("\n请及时续费，如已续费请忽略。");
    out
}

pub fn format_admin_summary(scan: &ExpiryScan) -> String {
    format!(
        "【到期汇总】即将到期{}辆，近期已过期{}辆",
        scan.soon.len(),
        scan.expired.len()
    )
}

/// Admin detail messages, at most `batch` plates each.
pub fn format_admin_batches(scan: &ExpiryScan, batch: usize) -> Vec<String> {
    let batch = batch.max(1);
    let tagged: Vec<String> = scan
        .soon
        .iter()
        .map(|f| format!("[即将到期] {}", finding_line(f)))
        .chain(
            scan.expired
                .iter()
                .map(|f| format!("[已过期] {}", finding_line(f))),
        )
        .collect();
    let total = tagged.chunks(batch).count();
    tagged
        .chunks(batch)
        .enumerate()
        .map(|(idx, chunk)| {
            let mut out = format!("到期明细（{}/{}）", idx + 1, total);
            for (n, line) in chunk.iter().enumerate() {
                out.push_str(&format!("\n{}. {}", idx * batch + n + 1, line));
            }
            out
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub persons: usize,
    pub bound_users: usize,
    pub plates: usize,
    pub by_class: BTreeMap<&'static str, usize>,
    pub expired: usize,
    pub imminent: usize,
    pub soon: usize,
}

pub fn compute_statistics(rows: &[(Plate, Option<Person>)], persons: &[Person], now: NaiveDateTime) -> Statistics {
    let mut stats = Statistics {
        persons: persons.len(),
        bound_users: persons.iter().filter(|p| p.wecom_userid.is_some()).count(),
        ..Statistics::default()
    };
    for (plate, _) in rows.iter().filter(|(p, _)| !p.deleted) {
        stats.plates += 1;
        *stats.by_class.entry(plate.class.label()).or_default() += 1;
        match plate.end_time.map(|end| ExpiryStatus::of(end, now)) {
            Some(ExpiryStatus::Expired) => stats.expired += 1,
            Some(ExpiryStatus::Imminent) => stats.imminent += 1,
            Some(ExpiryStatus::Soon) => stats.soon += 1,
            _ => {}
        }
    }
    stats
}

pub fn format_statistics(stats: &Statistics) -> String {
    let mut out = format!(
        "【车场统计】\n车主：{}人（已绑定{}人）\n车辆：{}辆",
        stats.persons, stats.bound_users, stats.plates
    );
    for (label, count) in &stats.by_class {
        out.push_str(&format!("\n  {label}：{count}辆"));
    }
    out.push_str(&format!(
        "\n已过期：{}辆\n7天内到期：{}辆\n30天内到期：{}辆",
        stats.expired, stats.imminent, stats.soon
    ));
    out
}
