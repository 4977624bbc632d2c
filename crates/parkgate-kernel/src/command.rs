//! Text-command sub-language.
//!
//! Tokens are separated by any run of characters that are neither
//! alphanumeric nor CJK. A leading keyword selects the command; without one
//! the single remaining token is a plate or owner query.

use std::fmt;

pub const HELP_TEXT: &str = "可用指令：\n\
车牌号或车主姓名：查询车辆\n\
价格：查看收费标准\n\
记录查询：最近30天续费记录\n\
绑定,姓名,手机号 / 解绑,姓名,手机号\n\
修改车牌,旧车牌,新车牌\n\
管理员：续期,车主,车牌,月数 | 备注,车牌,内容 | 删除,车牌 | 审批,车牌,月数 | 统计";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Query(String),
    Price,
    Stats,
    Help,
    Records,
    Renew {
        owner: String,
        plate: String,
        months: u32,
    },
    Remark {
        plate: String,
        text: String,
    },
    RenamePlate {
        old: String,
        new: String,
    },
    Delete {
        plate: String,
    },
    Bind {
        name: String,
        phone: String,
    },
    Unbind {
        name: String,
        phone: String,
    },
    Approval {
        plate: String,
        months: u32,
    },
}

impl Command {
    /// Commands restricted to the admin set.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Stats
                | Command::Renew { .. }
                | Command::Remark { .. }
                | Command::Delete { .. }
                | Command::Approval { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Query(_) => "query",
            Command::Price => "price",
            Command::Stats => "stats",
            Command::Help => "help",
            Command::Records => "records",
            Command::Renew { .. } => "renew",
            Command::Remark { .. } => "remark",
            Command::RenamePlate { .. } => "rename_plate",
            Command::Delete { .. } => "delete",
            Command::Bind { .. } => "bind",
            Command::Unbind { .. } => "unbind",
            Command::Approval { .. } => "approval",
        }
    }
}

/// Parse failure carrying the reply hint for the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub hint: String,
}

impl CommandError {
    fn format(expected: &str) -> Self {
        Self {
            hint: format!("指令格式错误，正确格式：{expected}"),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hint)
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Renew,
    Remark,
    Approval,
    Delete,
    Bind,
    Unbind,
    Records,
    Rename,
}

// Longer spellings first so that the bare prefix does not shadow them.
const KEYWORDS: &[(&str, Keyword)] = &[
    ("修改车牌", Keyword::Rename),
    ("修改", Keyword::Rename),
    ("记录查询", Keyword::Records),
    ("记录", Keyword::Records),
    ("续期", Keyword::Renew),
    ("备注", Keyword::Remark),
    ("审批", Keyword::Approval),
    ("删除", Keyword::Delete),
    ("绑定", Keyword::Bind),
    ("解绑", Keyword::Unbind),
];

pub fn is_separator(c: char) -> bool {
    !(c.is_alphanumeric() || is_cjk(c))
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}' | '\u{3400}'..='\u{4dbf}' | '\u{f900}'..='\u{faff}')
}

/// Upper-case with every separator removed. Idempotent.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !is_separator(*c))
        .flat_map(char::to_uppercase)
        .collect()
}

/// Collapses separator runs to single commas and upper-cases plate-like fields.
pub fn split_fields(raw: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    for c in raw.chars() {
        if is_separator(c) {
            if !current.is_empty() {
                fields.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
        .into_iter()
        .map(|f| {
            if f.chars().count() >= 6 && f.chars().any(|c| c.is_ascii_digit()) {
                f.to_uppercase()
            } else {
                f
            }
        })
        .collect()
}

fn strip_leading_separators(raw: &str) -> &str {
    raw.trim_start_matches(is_separator)
}

fn parse_months(raw: &str, expected: &str) -> Result<u32, CommandError> {
    match raw.parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(CommandError::format(expected)),
    }
}

pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CommandError {
            hint: HELP_TEXT.to_string(),
        });
    }
    match trimmed {
        "价格" => return Ok(Command::Price),
        "统计" => return Ok(Command::Stats),
        "帮助" | "help" | "?" | "？" => return Ok(Command::Help),
        _ => {}
    }

    let Some((keyword, rest)) = KEYWORDS
        .iter()
        .find_map(|(kw, k)| trimmed.strip_prefix(kw).map(|rest| (*k, rest)))
    else {
        let fields = split_fields(trimmed);
        return match fields.as_slice() {
            [single] => Ok(Command::Query(single.clone())),
            _ => Err(CommandError {
                hint: HELP_TEXT.to_string(),
            }),
        };
    };
    let rest = strip_leading_separators(rest);

    if keyword == Keyword::Remark {
        const EXPECTED: &str = "备注,车牌,备注内容";
        let split_at = rest.find(is_separator).unwrap_or(rest.len());
        let (plate_raw, text) = rest.split_at(split_at);
        let plate = normalize_plate(plate_raw);
        let text = strip_leading_separators(text).trim();
        if plate.is_empty() || text.is_empty() {
            return Err(CommandError::format(EXPECTED));
        }
        return Ok(Command::Remark {
            plate,
            text: text.to_string(),
        });
    }

    let fields = split_fields(rest);
    match keyword {
        Keyword::Renew => {
            const EXPECTED: &str = "续期,车主,车牌,月数";
            match fields.as_slice() {
                [owner, plate, months] => Ok(Command::Renew {
                    owner: owner.clone(),
                    plate: normalize_plate(plate),
                    months: parse_months(months, EXPECTED)?,
                }),
                _ => Err(CommandError::format(EXPECTED)),
            }
        }
        Keyword::Rename => match fields.as_slice() {
            [old, new] => Ok(Command::RenamePlate {
                old: normalize_plate(old),
                new: normalize_plate(new),
            }),
            _ => Err(CommandError::format("修改车牌,旧车牌,新车牌")),
        },
        Keyword::Delete => match fields.as_slice() {
            [plate] => Ok(Command::Delete {
                plate: normalize_plate(plate),
            }),
            _ => Err(CommandError::format("删除,车牌")),
        },
        Keyword::Bind | Keyword::Unbind => match fields.as_slice() {
            [name, phone] => {
                let (name, phone) = (name.clone(), phone.clone());
                Ok(if keyword == Keyword::Bind {
                    Command::Bind { name, phone }
                } else {
                    Command::Unbind { name, phone }
                })
            }
            _ if keyword == Keyword::Bind => Err(CommandError::format("绑定,姓名,手机号")),
            _ => Err(CommandError::format("解绑,姓名,手机号")),
        },
        Keyword::Approval => {
            const EXPECTED: &str = "审批,车牌,月数";
            match fields.as_slice() {
                [plate, months] => Ok(Command::Approval {
                    plate: normalize_plate(plate),
                    months: parse_months(months, EXPECTED)?,
                }),
                _ => Err(CommandError::format(EXPECTED)),
            }
        }
        Keyword::Records => {
            if fields.is_empty() {
                Ok(Command::Records)
            } else {
                Err(CommandError::format("记录查询"))
            }
        }
        Keyword::Remark => Err(CommandError::format("备注,车牌,备注内容")),
    }
}
