//! SQLite-backed record of persons, plates, renewal tickets and fee records.
//!
//! Callers hold the store behind a single async mutex, so every operation here
//! runs to completion before another starts. Multi-row mutations additionally
//! run inside a transaction so a failure leaves no partial write behind.

use chrono::NaiveDateTime;
use parkgate_contracts::{
    format_timestamp, parse_timestamp, CarParkRecord, CarParkSnapshot, FeeRecord, Person, Plate,
    PlateClass, RenewalTicket, TicketState,
};
use parkgate_kernel::{approval_marker, renewal_end, RenewalForm};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;

use crate::error::GatewayError;

const PLATE_COLUMNS: &str = "pl.plate, pl.person_id, pl.class, pl.start_time, pl.end_time, \
     pl.remark, pl.deleted, pl.modified_at, pl.synced";
const PERSON_COLUMNS: &str = "pe.id, pe.name, pe.sex, pe.department, pe.address, pe.phone, \
     pe.slot_count, pe.national_id, pe.external_ref, pe.external_ref2, pe.wecom_userid";
const TICKET_COLUMNS: &str =
    "id, owner, plate, months, created_at, state, comment, remark, approval_sp_no";
const FEE_COLUMNS: &str = "f.id, f.plate, f.owner, f.money, f.created_at, f.remark, f.approval_sp_no";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub owner: String,
    pub plate: String,
    pub months: u32,
    pub state: TicketState,
    pub remark: String,
}

/// Result of moving the oldest open ticket of a plate to a terminal state.
#[derive(Debug, Clone)]
pub struct Transition {
    pub ticket: RenewalTicket,
    /// Set when the requested state could not be applied and the ticket failed instead.
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppliedApproval {
    pub plate: Plate,
    pub owner: String,
    pub recorded_owner: String,
    pub ticket_id: i64,
    pub fee_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpsertCounts {
    pub persons: usize,
    pub plates: usize,
}

/// A non-empty remark already held by the gateway wins over the pushed one.
pub fn authoritative_remark(existing: Option<&str>, incoming: &str) -> String {
    match existing {
        Some(remark) if !remark.trim().is_empty() => remark.to_string(),
        _ => incoming.to_string(),
    }
}

/// An unsynced gateway end time stands until the agent reports one at least
/// as late.
pub fn authoritative_end_time(current: &Plate, incoming: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
    match (current.synced, current.end_time, incoming) {
        (false, Some(ours), Some(theirs)) if ours > theirs => Some(ours),
        (false, Some(ours), None) => Some(ours),
        _ => incoming,
    }
}

/// A pending gateway deletion holds until the agent reports a change made
/// after it. Deletions that came from the agent follow the agent.
pub fn authoritative_deleted(current: &Plate, incoming: &Plate) -> bool {
    if incoming.deleted || !current.deleted || current.synced {
        return incoming.deleted;
    }
    match (current.modified_at, incoming.modified_at) {
        (Some(ours), Some(theirs)) => theirs <= ours,
        _ => true,
    }
}

/// Row written for one pushed plate after the authority rules are applied.
struct MergedPlate {
    end_time: Option<NaiveDateTime>,
    remark: String,
    deleted: bool,
    modified_at: NaiveDateTime,
    /// Only set once the agent's row agrees with every gateway-held value.
    synced: bool,
}

fn merge_plate(current: Option<&Plate>, incoming: &Plate, now: NaiveDateTime) -> MergedPlate {
    let pushed_at = incoming.modified_at.unwrap_or(now);
    let Some(current) = current else {
        return MergedPlate {
            end_time: incoming.end_time,
            remark: incoming.remark.clone(),
            deleted: incoming.deleted,
            modified_at: pushed_at,
            synced: true,
        };
    };
    let end_time = authoritative_end_time(current, incoming.end_time);
    let remark = authoritative_remark(Some(&current.remark), &incoming.remark);
    let deleted = authoritative_deleted(current, incoming);
    let synced = end_time == incoming.end_time && remark == incoming.remark && deleted == incoming.deleted;
    let modified_at = match current.modified_at {
        Some(ours) if !synced => ours.max(pushed_at),
        _ => pushed_at,
    };
    MergedPlate {
        end_time,
        remark,
        deleted,
        modified_at,
        synced,
    }
}

fn ts(v: &Option<NaiveDateTime>) -> Option<String> {
    v.as_ref().map(format_timestamp)
}

fn parse_ts_column(raw: Option<String>) -> Option<NaiveDateTime> {
    raw.as_deref().and_then(parse_timestamp)
}

fn plate_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Plate> {
    let class: String = row.get(at + 2)?;
    Ok(Plate {
        plate: row.get(at)?,
        person_id: row.get(at + 1)?,
        class: PlateClass::parse(&class).unwrap_or(PlateClass::OwnerPrimary),
        start_time: parse_ts_column(row.get(at + 3)?),
        end_time: parse_ts_column(row.get(at + 4)?),
        remark: row.get(at + 5)?,
        deleted: row.get(at + 6)?,
        modified_at: parse_ts_column(row.get(at + 7)?),
        synced: row.get(at + 8)?,
    })
}

fn person_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Option<Person>> {
    let Some(id) = row.get::<_, Option<String>>(at)? else {
        return Ok(None);
    };
    Ok(Some(Person {
        id,
        name: row.get(at + 1)?,
        sex: row.get(at + 2)?,
        department: row.get(at + 3)?,
        address: row.get(at + 4)?,
        phone: row.get(at + 5)?,
        slot_count: row.get(at + 6)?,
        national_id: row.get(at + 7)?,
        external_ref: row.get(at + 8)?,
        external_ref2: row.get(at + 9)?,
        wecom_userid: row.get(at + 10)?,
    }))
}

fn joined_from_row(row: &Row<'_>) -> rusqlite::Result<(Plate, Option<Person>)> {
    Ok((plate_from_row(row, 0)?, person_from_row(row, 9)?))
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<RenewalTicket> {
    let created_at: String = row.get(4)?;
    let state: String = row.get(5)?;
    Ok(RenewalTicket {
        id: row.get(0)?,
        owner: row.get(1)?,
        plate: row.get(2)?,
        months: row.get(3)?,
        created_at: parse_timestamp(&created_at).unwrap_or_default(),
        state: TicketState::parse(&state).unwrap_or(TicketState::Failed),
        comment: row.get(6)?,
        remark: row.get(7)?,
        approval_sp_no: row.get(8)?,
    })
}

fn fee_from_row(row: &Row<'_>) -> rusqlite::Result<FeeRecord> {
    let created_at: String = row.get(4)?;
    Ok(FeeRecord {
        id: row.get(0)?,
        plate: row.get(1)?,
        owner: row.get(2)?,
        money: row.get(3)?,
        created_at: parse_timestamp(&created_at).unwrap_or_default(),
        remark: row.get(5)?,
        approval_sp_no: row.get(6)?,
    })
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, GatewayError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, GatewayError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS person (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                sex TEXT NOT NULL DEFAULT '',
                department TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                slot_count INTEGER NOT NULL DEFAULT 0,
                national_id TEXT NOT NULL DEFAULT '',
                external_ref TEXT NOT NULL DEFAULT '',
                external_ref2 TEXT NOT NULL DEFAULT '',
                wecom_userid TEXT UNIQUE
            );
            CREATE TABLE IF NOT EXISTS plate (
                plate TEXT PRIMARY KEY,
                person_id TEXT NOT NULL,
                class TEXT NOT NULL,
                start_time TEXT,
                end_time TEXT,
                remark TEXT NOT NULL DEFAULT '',
                deleted INTEGER NOT NULL DEFAULT 0,
                modified_at TEXT,
                synced INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS plate_person ON plate(person_id);
            CREATE TABLE IF NOT EXISTS renewal_ticket (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                plate TEXT NOT NULL,
                months INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                comment TEXT NOT NULL DEFAULT '',
                remark TEXT NOT NULL DEFAULT '',
                approval_sp_no TEXT
            );
            CREATE INDEX IF NOT EXISTS ticket_plate_state ON renewal_ticket(plate, state);
            CREATE INDEX IF NOT EXISTS ticket_sp_no ON renewal_ticket(approval_sp_no);
            CREATE TABLE IF NOT EXISTS fee_record (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plate TEXT NOT NULL,
                owner TEXT NOT NULL,
                money TEXT NOT NULL,
                created_at TEXT NOT NULL,
                remark TEXT NOT NULL DEFAULT '',
                approval_sp_no TEXT
            );
            CREATE INDEX IF NOT EXISTS fee_sp_no ON fee_record(approval_sp_no);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn persons(&self) -> Result<Vec<Person>, GatewayError> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM person pe ORDER BY pe.id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| person_from_row(row, 0))?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(person) = row? {
                out.push(person);
            }
        }
        Ok(out)
    }

    pub fn person_bound_to(&self, user_id: &str) -> Result<Option<Person>, GatewayError> {
        let sql = format!("SELECT {PERSON_COLUMNS} FROM person pe WHERE pe.wecom_userid = ?1");
        let person = self
            .conn
            .query_row(&sql, params![user_id], |row| person_from_row(row, 0))
            .optional()?;
        Ok(person.flatten())
    }

    fn person_by_name_phone(&self, name: &str, phone: &str) -> Result<Option<Person>, GatewayError> {
        let sql = format!(
            "SELECT {PERSON_COLUMNS} FROM person pe WHERE pe.name = ?1 AND pe.phone = ?2 ORDER BY pe.id LIMIT 1"
        );
        let person = self
            .conn
            .query_row(&sql, params![name, phone], |row| person_from_row(row, 0))
            .optional()?;
        Ok(person.flatten())
    }

    /// Non-deleted plate with its owner, if any.
    pub fn find_plate(&self, plate: &str) -> Result<Option<(Plate, Option<Person>)>, GatewayError> {
        let sql = format!(
            "SELECT {PLATE_COLUMNS}, {PERSON_COLUMNS} FROM plate pl \
             LEFT JOIN person pe ON pe.id = pl.person_id \
             WHERE pl.plate = ?1 AND pl.deleted = 0"
        );
        Ok(self
            .conn
            .query_row(&sql, params![plate], joined_from_row)
            .optional()?)
    }

    /// Non-deleted plates whose owner name starts with `prefix`.
    pub fn search_by_owner(
        &self,
        prefix: &str,
        max: usize,
    ) -> Result<Vec<(Plate, Option<Person>)>, GatewayError> {
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let sql = format!(
            "SELECT {PLATE_COLUMNS}, {PERSON_COLUMNS} FROM plate pl \
             JOIN person pe ON pe.id = pl.person_id \
             WHERE pe.name LIKE ?1 ESCAPE '\\' AND pl.deleted = 0 \
             ORDER BY pe.name, pl.plate LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, max as i64], joined_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Every non-deleted plate joined with its owner.
    pub fn active_plates(&self) -> Result<Vec<(Plate, Option<Person>)>, GatewayError> {
        let sql = format!(
            "SELECT {PLATE_COLUMNS}, {PERSON_COLUMNS} FROM plate pl \
             LEFT JOIN person pe ON pe.id = pl.person_id \
             WHERE pl.deleted = 0 ORDER BY pl.plate"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], joined_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_plates(&self) -> Result<Vec<Plate>, GatewayError> {
        let sql = format!("SELECT {PLATE_COLUMNS} FROM plate pl ORDER BY pl.plate");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| plate_from_row(row, 0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn set_remark(&mut self, plate: &str, remark: &str, now: NaiveDateTime) -> Result<(), GatewayError> {
        let changed = self.conn.execute(
            "UPDATE plate SET remark = ?2, modified_at = ?3, synced = 0 WHERE plate = ?1 AND deleted = 0",
            params![plate, remark, format_timestamp(&now)],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("车牌 {plate}")));
        }
        Ok(())
    }

    pub fn soft_delete(&mut self, plate: &str, now: NaiveDateTime) -> Result<(), GatewayError> {
        let changed = self.conn.execute(
            "UPDATE plate SET deleted = 1, modified_at = ?2, synced = 0 WHERE plate = ?1 AND deleted = 0",
            params![plate, format_timestamp(&now)],
        )?;
        if changed == 0 {
            return Err(GatewayError::NotFound(format!("车牌 {plate}")));
        }
        Ok(())
    }

    /// Binds `user_id` to the person identified by name and phone.
    pub fn bind(&mut self, name: &str, phone: &str, user_id: &str) -> Result<BindOutcome, GatewayError> {
        let person = self
            .person_by_name_phone(name, phone)?
            .ok_or_else(|| GatewayError::NotFound(format!("人员 {name}")))?;
        match person.wecom_userid.as_deref() {
            Some(bound) if bound == user_id => return Ok(BindOutcome::AlreadyBound),
            Some(_) => {
                return Err(GatewayError::Conflict(format!(
                    "{name} 已绑定其他企业微信账号"
                )))
            }
            None => {}
        }
        if let Some(other) = self.person_bound_to(user_id)? {
            return Err(GatewayError::Conflict(format!(
                "当前账号已绑定 {}，请先解绑",
                other.name
            )));
        }
        self.conn.execute(
            "UPDATE person SET wecom_userid = ?2 WHERE id = ?1",
            params![person.id, user_id],
        )?;
        Ok(BindOutcome::Bound)
    }

    /// Clears the binding of the person identified by name and phone.
    /// Only the bound account itself or an admin may unbind.
    pub fn unbind(&mut self, name: &str, phone: &str, user_id: &str, is_admin: bool) -> Result<(), GatewayError> {
        let person = self
            .person_by_name_phone(name, phone)?
            .ok_or_else(|| GatewayError::NotFound(format!("人员 {name}")))?;
        match person.wecom_userid.as_deref() {
            None => Err(GatewayError::Conflict(format!("{name} 尚未绑定"))),
            Some(bound) if bound != user_id && !is_admin => {
                Err(GatewayError::Conflict(format!("{name} 绑定的不是当前账号")))
            }
            Some(_) => {
                self.conn.execute(
                    "UPDATE person SET wecom_userid = NULL WHERE id = ?1",
                    params![person.id],
                )?;
                Ok(())
            }
        }
    }

    pub fn insert_ticket(&mut self, ticket: &NewTicket, now: NaiveDateTime) -> Result<RenewalTicket, GatewayError> {
        let tx = self.conn.transaction()?;
        if !plate_exists(&tx, &ticket.plate)? {
            return Err(GatewayError::NotFound(format!("车牌 {}", ticket.plate)));
        }
        let id = insert_ticket_row(&tx, ticket, None, now)?;
        let created = load_ticket(&tx, id)?;
        tx.commit()?;
        Ok(created)
    }

    /// Open tickets (pending or change) in creation order.
    pub fn open_tickets(&self) -> Result<Vec<RenewalTicket>, GatewayError> {
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM renewal_ticket WHERE state IN ('pending', 'change') ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], ticket_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn ticket(&self, id: i64) -> Result<RenewalTicket, GatewayError> {
        load_ticket(&self.conn, id)
    }

    /// Moves the oldest open ticket of `plate` to `next`.
    ///
    /// A `changed` result on a change ticket renames the plate to the new
    /// number held in the ticket remark within the same transaction. When the
    /// plate row is gone, or the rename target already exists, the ticket is
    /// failed instead and the reason is returned alongside.
    pub fn transition_oldest_open(
        &mut self,
        plate: &str,
        next: TicketState,
        comment: &str,
        now: NaiveDateTime,
    ) -> Result<Transition, GatewayError> {
        let tx = self.conn.transaction()?;
        let sql = format!(
            "SELECT {TICKET_COLUMNS} FROM renewal_ticket \
             WHERE plate = ?1 AND state IN ('pending', 'change') ORDER BY id LIMIT 1"
        );
        let ticket = tx
            .query_row(&sql, params![plate], ticket_from_row)
            .optional()?
            .ok_or_else(|| GatewayError::NotFound(format!("车牌 {plate} 的待处理工单")))?;
        if !ticket.state.can_transition_to(next) {
            return Err(GatewayError::Invalid(format!(
                "ticket {} cannot move from {} to {}",
                ticket.id,
                ticket.state.as_str(),
                next.as_str()
            )));
        }

        let stamp = format_timestamp(&now);
        let mut failure = None;
        match next {
            TicketState::Failed => {}
            _ if !plate_exists(&tx, plate)? => failure = Some("车牌不存在".to_string()),
            TicketState::Changed if ticket.state == TicketState::Change => {
                let target = ticket.remark.trim();
                if target.is_empty() {
                    failure = Some("缺少新车牌".to_string());
                } else if any_plate_row(&tx, target)? {
                    failure = Some(format!("新车牌 {target} 已存在"));
                } else {
                    tx.execute(
                        "UPDATE plate SET plate = ?2, modified_at = ?3, synced = 0 WHERE plate = ?1",
                        params![plate, target, stamp],
                    )?;
                }
            }
            _ => {}
        }

        let (state, comment) = match &failure {
            Some(reason) if comment.is_empty() => (TicketState::Failed, reason.clone()),
            Some(reason) => (TicketState::Failed, format!("{comment}；{reason}")),
            None => (next, comment.to_string()),
        };
        tx.execute(
            "UPDATE renewal_ticket SET state = ?2, comment = ?3 WHERE id = ?1",
            params![ticket.id, state.as_str(), comment],
        )?;
        let ticket = load_ticket(&tx, ticket.id)?;
        tx.commit()?;
        Ok(Transition { ticket, failure })
    }

    pub fn approval_seen(&self, sp_no: &str) -> Result<bool, GatewayError> {
        approval_seen(&self.conn, sp_no)
    }

    /// Records an approved renewal: plate end time and class, a fee record and
    /// a pending ticket for the site agent, all or nothing.
    pub fn apply_approval(
        &mut self,
        sp_no: &str,
        form: &RenewalForm,
        now: NaiveDateTime,
    ) -> Result<AppliedApproval, GatewayError> {
        let tx = self.conn.transaction()?;
        if approval_seen(&tx, sp_no)? {
            return Err(GatewayError::Conflict(format!("审批单号 {sp_no} 已经处理过")));
        }
        let sql = format!(
            "SELECT {PLATE_COLUMNS}, {PERSON_COLUMNS} FROM plate pl \
             LEFT JOIN person pe ON pe.id = pl.person_id \
             WHERE pl.plate = ?1 AND pl.deleted = 0"
        );
        let (mut plate, person) = tx
            .query_row(&sql, params![form.plate], joined_from_row)
            .optional()?
            .ok_or_else(|| GatewayError::NotFound(format!("车牌 {}", form.plate)))?;

        let recorded_owner = person.map(|p| p.name).unwrap_or_default();
        let owner = if form.owner.is_empty() {
            recorded_owner.clone()
        } else {
            form.owner.clone()
        };
        plate.class = form.class();
        plate.end_time = Some(renewal_end(plate.end_time, form.months, now));
        plate.modified_at = Some(now);
        plate.synced = false;
        tx.execute(
            "UPDATE plate SET class = ?2, end_time = ?3, modified_at = ?4, synced = 0 WHERE plate = ?1",
            params![plate.plate, plate.class.as_str(), ts(&plate.end_time), ts(&plate.modified_at)],
        )?;

        let marker = approval_marker(sp_no);
        tx.execute(
            "INSERT INTO fee_record (plate, owner, money, created_at, remark, approval_sp_no) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![plate.plate, owner, form.money, format_timestamp(&now), marker, sp_no],
        )?;
        let fee_id = tx.last_insert_rowid();
        let ticket_id = insert_ticket_row(
            &tx,
            &NewTicket {
                owner: owner.clone(),
                plate: plate.plate.clone(),
                months: form.months,
                state: TicketState::Pending,
                remark: marker,
            },
            Some(sp_no),
            now,
        )?;
        tx.commit()?;
        Ok(AppliedApproval {
            plate,
            owner,
            recorded_owner,
            ticket_id,
            fee_id,
        })
    }

    /// Fee records for plates owned by the person bound to `user_id`, newest first.
    pub fn fee_records_for_user(
        &self,
        user_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<FeeRecord>, GatewayError> {
        let sql = format!(
            "SELECT {FEE_COLUMNS} FROM fee_record f \
             JOIN plate pl ON pl.plate = f.plate \
             JOIN person pe ON pe.id = pl.person_id \
             WHERE pe.wecom_userid = ?1 AND f.created_at >= ?2 \
             ORDER BY f.created_at DESC, f.id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, format_timestamp(&since)], fee_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Looks a plate up by number, or by exact owner name when no number is given.
    pub fn lookup(
        &self,
        car_number: Option<&str>,
        owner_name: Option<&str>,
    ) -> Result<Option<CarParkRecord>, GatewayError> {
        let found = match (car_number, owner_name) {
            (Some(plate), _) if !plate.is_empty() => self.find_plate(plate)?,
            (_, Some(name)) if !name.is_empty() => {
                let sql = format!(
                    "SELECT {PLATE_COLUMNS}, {PERSON_COLUMNS} FROM plate pl \
                     JOIN person pe ON pe.id = pl.person_id \
                     WHERE pe.name = ?1 AND pl.deleted = 0 ORDER BY pl.plate LIMIT 1"
                );
                self.conn
                    .query_row(&sql, params![name], joined_from_row)
                    .optional()?
            }
            _ => return Err(GatewayError::Invalid("car_number or owner_name is required".to_string())),
        };
        Ok(found.map(|(plate, person)| CarParkRecord { plate, person }))
    }

    /// Full dump including soft-deleted plates, so the agent can mirror deletions.
    pub fn snapshot(&self) -> Result<CarParkSnapshot, GatewayError> {
        Ok(CarParkSnapshot {
            persons: self.persons()?,
            plates: self.all_plates()?,
        })
    }

    /// Applies an agent push. Bindings survive, and each plate goes through
    /// the remark, end time and deletion authority rules. A row stays
    /// unsynced until the agent has caught up with the gateway's values.
    pub fn upsert_snapshot(
        &mut self,
        snapshot: &CarParkSnapshot,
        now: NaiveDateTime,
    ) -> Result<UpsertCounts, GatewayError> {
        let tx = self.conn.transaction()?;
        for p in &snapshot.persons {
            tx.execute(
                "INSERT INTO person (id, name, sex, department, address, phone, slot_count, \
                     national_id, external_ref, external_ref2) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, sex = excluded.sex, \
                     department = excluded.department, address = excluded.address, \
                     phone = excluded.phone, slot_count = excluded.slot_count, \
                     national_id = excluded.national_id, external_ref = excluded.external_ref, \
                     external_ref2 = excluded.external_ref2",
                params![
                    p.id,
                    p.name,
                    p.sex,
                    p.department,
                    p.address,
                    p.phone,
                    p.slot_count,
                    p.national_id,
                    p.external_ref,
                    p.external_ref2
                ],
            )?;
        }

        for incoming in &snapshot.plates {
            let existing = tx
                .query_row(
                    &format!("SELECT {PLATE_COLUMNS} FROM plate pl WHERE pl.plate = ?1"),
                    params![incoming.plate],
                    |row| plate_from_row(row, 0),
                )
                .optional()?;
            let merged = merge_plate(existing.as_ref(), incoming, now);
            tx.execute(
                "INSERT INTO plate (plate, person_id, class, start_time, end_time, remark, deleted, modified_at, synced) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(plate) DO UPDATE SET person_id = excluded.person_id, class = excluded.class, \
                     start_time = excluded.start_time, end_time = excluded.end_time, remark = excluded.remark, \
                     deleted = excluded.deleted, modified_at = excluded.modified_at, synced = excluded.synced",
                params![
                    incoming.plate,
                    incoming.person_id,
                    incoming.class.as_str(),
                    ts(&incoming.start_time),
                    ts(&merged.end_time),
                    merged.remark,
                    merged.deleted,
                    format_timestamp(&merged.modified_at),
                    merged.synced
                ],
            )?;
        }
        tx.commit()?;
        Ok(UpsertCounts {
            persons: snapshot.persons.len(),
            plates: snapshot.plates.len(),
        })
    }
}

fn plate_exists(conn: &Connection, plate: &str) -> Result<bool, GatewayError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM plate WHERE plate = ?1 AND deleted = 0",
            params![plate],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn any_plate_row(conn: &Connection, plate: &str) -> Result<bool, GatewayError> {
    Ok(conn
        .query_row("SELECT 1 FROM plate WHERE plate = ?1", params![plate], |_| Ok(()))
        .optional()?
        .is_some())
}

fn approval_seen(conn: &Connection, sp_no: &str) -> Result<bool, GatewayError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM renewal_ticket WHERE approval_sp_no = ?1 \
             UNION ALL SELECT 1 FROM fee_record WHERE approval_sp_no = ?1 LIMIT 1",
            params![sp_no],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn load_ticket(conn: &Connection, id: i64) -> Result<RenewalTicket, GatewayError> {
    let sql = format!("SELECT {TICKET_COLUMNS} FROM renewal_ticket WHERE id = ?1");
    conn.query_row(&sql, params![id], ticket_from_row)
        .optional()?
        .ok_or_else(|| GatewayError::NotFound(format!("工单 {id}")))
}

fn insert_ticket_row(
    tx: &Transaction<'_>,
    ticket: &NewTicket,
    sp_no: Option<&str>,
    now: NaiveDateTime,
) -> Result<i64, GatewayError> {
    tx.execute(
        "INSERT INTO renewal_ticket (owner, plate, months, created_at, state, comment, remark, approval_sp_no) \
         VALUES (?1, ?2, ?3, ?4, ?5, '', ?6, ?7)",
        params![
            ticket.owner,
            ticket.plate,
            ticket.months,
            format_timestamp(&now),
            ticket.state.as_str(),
            ticket.remark,
            sp_no
        ],
    )?;
    Ok(tx.last_insert_rowid())
}
