//! The points ledger: users, point transactions and the totals derived
//! from them.
//!
//! [`Ledger`] is the persistence boundary the jobs and handlers read
//! through. [`MemoryLedger`] keeps everything in process.

pub mod jobs;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::background::{AppContext, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Teacher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: Role,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Points a teacher awarded a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointTransaction {
    pub id: u64,
    pub teacher_id: u64,
    pub student_id: u64,
    pub points: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("no user with id {0}")]
    UnknownUser(u64),

    #[error("user {id} is not a {expected}")]
    WrongRole { id: u64, expected: Role },
}

impl From<LedgerError> for TaskError {
    fn from(e: LedgerError) -> Self {
        TaskError::new(e.to_string())
    }
}

/// Read/write access to users and their point transactions.
pub trait Ledger: Send + Sync {
    fn user(&self, id: u64) -> Result<Option<User>, LedgerError>;

    fn users_with_role(&self, role: Role) -> Result<Vec<User>, LedgerError>;

    /// Transactions with `from <= created_at < to`.
    fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PointTransaction>, LedgerError>;

    /// Sum of points a student has received.
    fn points_received(&self, student_id: u64) -> Result<i64, LedgerError>;

    /// Sum of points a teacher has given.
    fn points_given(&self, teacher_id: u64) -> Result<i64, LedgerError>;

    fn last_transaction_by(&self, teacher_id: u64) -> Result<Option<PointTransaction>, LedgerError>;

    /// Persists precomputed totals, keyed by user id.
    fn store_totals(&self, totals: &[(u64, i64)]) -> Result<(), LedgerError>;

    fn stored_total(&self, user_id: u64) -> Result<Option<i64>, LedgerError>;

    fn open_session(&self) -> Result<(), LedgerError>;

    fn close_session(&self);
}

/// A user's live point total: received for students, given for teachers.
pub fn total_points(ledger: &dyn Ledger, user: &User) -> Result<i64, LedgerError> {
    match user.role {
        Role::Student => ledger.points_received(user.id),
        Role::Teacher => ledger.points_given(user.id),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: u64,
    pub name: String,
    pub points: i64,
}

/// Top `limit` students by points received. Ties keep id order.
pub fn leaderboard(ledger: &dyn Ledger, limit: usize) -> Result<Vec<LeaderboardEntry>, LedgerError> {
    let mut rows = ledger
        .users_with_role(Role::Student)?
        .into_iter()
        .map(|student| Ok((ledger.points_received(student.id)?, student)))
        .collect::<Result<Vec<_>, LedgerError>>()?;
    rows.sort_by(|(a, sa), (b, sb)| b.cmp(a).then(sa.id.cmp(&sb.id)));

    Ok(rows
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (points, student))| LeaderboardEntry {
            rank: i + 1,
            user_id: student.id,
            name: student.full_name(),
            points,
        })
        .collect())
}

/// Runs queued tasks inside a ledger session.
pub struct LedgerContext {
    ledger: Arc<dyn Ledger>,
}

impl LedgerContext {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

impl AppContext for LedgerContext {
    fn acquire(&self) -> Result<(), TaskError> {
        self.ledger.open_session().map_err(TaskError::from)
    }

    fn release(&self) {
        self.ledger.close_session();
    }
}

#[derive(Default)]
struct LedgerState {
    users: BTreeMap<u64, User>,
    transactions: Vec<PointTransaction>,
    totals: HashMap<u64, i64>,
    open_sessions: usize,
    offline: bool,
}

/// In-process [`Ledger`].
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(
        &self,
        role: Role,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> User {
        let mut state = self.lock();
        let id = state.users.keys().next_back().map_or(1, |last| last + 1);
        let user = User {
            id,
            first_name: first_name.to_owned(),
            last_name: last_name.to_owned(),
            email: email.to_owned(),
            role,
        };
        state.users.insert(id, user.clone());
        user
    }

    /// Records `points` from a teacher to a student.
    pub fn award(
        &self,
        teacher_id: u64,
        student_id: u64,
        points: i64,
        at: DateTime<Utc>,
    ) -> Result<PointTransaction, LedgerError> {
        let mut state = self.lock();
        state.ensure_online()?;
        state.expect_role(teacher_id, Role::Teacher)?;
        state.expect_role(student_id, Role::Student)?;

        let tx = PointTransaction {
            id: state.transactions.len() as u64 + 1,
            teacher_id,
            student_id,
            points,
            created_at: at,
        };
        state.transactions.push(tx.clone());
        debug!(teacher_id, student_id, points, "points awarded");
        Ok(tx)
    }

    /// Makes every read fail with [`LedgerError::Unavailable`] until set
    /// back to `false`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn online(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        let state = self.lock();
        state.ensure_online()?;
        Ok(state)
    }
}

impl LedgerState {
    fn ensure_online(&self) -> Result<(), LedgerError> {
        if self.offline {
            Err(LedgerError::Unavailable("database unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn expect_role(&self, id: u64, expected: Role) -> Result<(), LedgerError> {
        match self.users.get(&id) {
            None => Err(LedgerError::UnknownUser(id)),
            Some(user) if user.role != expected => Err(LedgerError::WrongRole { id, expected }),
            Some(_) => Ok(()),
        }
    }
}

impl Ledger for MemoryLedger {
    fn user(&self, id: u64) -> Result<Option<User>, LedgerError> {
        Ok(self.online()?.users.get(&id).cloned())
    }

    fn users_with_role(&self, role: Role) -> Result<Vec<User>, LedgerError> {
        Ok(self
            .online()?
            .users
            .values()
            .filter(|u| u.role == role)
            .cloned()
            .collect())
    }

    fn transactions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PointTransaction>, LedgerError> {
        Ok(self
            .online()?
            .transactions
            .iter()
            .filter(|tx| tx.created_at >= from && tx.created_at < to)
            .cloned()
            .collect())
    }

    fn points_received(&self, student_id: u64) -> Result<i64, LedgerError> {
        Ok(self
            .online()?
            .transactions
            .iter()
            .filter(|tx| tx.student_id == student_id)
            .map(|tx| tx.points)
            .sum())
    }

    fn points_given(&self, teacher_id: u64) -> Result<i64, LedgerError> {
        Ok(self
            .online()?
            .transactions
            .iter()
            .filter(|tx| tx.teacher_id == teacher_id)
            .map(|tx| tx.points)
            .sum())
    }

    fn last_transaction_by(&self, teacher_id: u64) -> Result<Option<PointTransaction>, LedgerError> {
        Ok(self
            .online()?
            .transactions
            .iter()
            .filter(|tx| tx.teacher_id == teacher_id)
            .max_by_key(|tx| tx.created_at)
            .cloned())
    }

    fn store_totals(&self, totals: &[(u64, i64)]) -> Result<(), LedgerError> {
        let mut state = self.online()?;
        state.totals.extend(totals.iter().copied());
        Ok(())
    }

    fn stored_total(&self, user_id: u64) -> Result<Option<i64>, LedgerError> {
        Ok(self.online()?.totals.get(&user_id).copied())
    }

    fn open_session(&self) -> Result<(), LedgerError> {
        let mut state = self.online()?;
        state.open_sessions += 1;
        Ok(())
    }

    fn close_session(&self) {
        let mut state = self.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn totals_by_role() {
        let ledger = MemoryLedger::new();
        let teacher = ledger.add_user(Role::Teacher, "Ada", "Byron", "ada@school.test");
        let a = ledger.add_user(Role::Student, "Sam", "Lee", "sam@school.test");
        let b = ledger.add_user(Role::Student, "Kim", "Ng", "kim@school.test");
        ledger.award(teacher.id, a.id, 5, t0()).unwrap();
        ledger.award(teacher.id, b.id, 3, t0()).unwrap();
        ledger.award(teacher.id, a.id, -1, t0()).unwrap();

        assert_eq!(total_points(&ledger, &a).unwrap(), 4);
        assert_eq!(total_points(&ledger, &teacher).unwrap(), 7);
    }

    #[test]
    fn award_checks_roles() {
        let ledger = MemoryLedger::new();
        let teacher = ledger.add_user(Role::Teacher, "Ada", "Byron", "ada@school.test");
        let student = ledger.add_user(Role::Student, "Sam", "Lee", "sam@school.test");
        assert_eq!(
            ledger.award(student.id, teacher.id, 1, t0()),
            Err(LedgerError::WrongRole {
                id: student.id,
                expected: Role::Teacher
            })
        );
        assert_eq!(
            ledger.award(teacher.id, 99, 1, t0()),
            Err(LedgerError::UnknownUser(99))
        );
    }

    #[test]
    fn window_is_half_open() {
        let ledger = MemoryLedger::new();
        let teacher = ledger.add_user(Role::Teacher, "Ada", "Byron", "ada@school.test");
        let student = ledger.add_user(Role::Student, "Sam", "Lee", "sam@school.test");
        let from = t0();
        let to = from + TimeDelta::days(1);
        ledger.award(teacher.id, student.id, 1, from).unwrap();
        ledger.award(teacher.id, student.id, 1, to).unwrap();

        assert_eq!(ledger.transactions_between(from, to).unwrap().len(), 1);
    }

    #[test]
    fn leaderboard_orders_by_points_then_id() {
        let ledger = MemoryLedger::new();
        let teacher = ledger.add_user(Role::Teacher, "Ada", "Byron", "ada@school.test");
        let a = ledger.add_user(Role::Student, "Sam", "Lee", "sam@school.test");
        let b = ledger.add_user(Role::Student, "Kim", "Ng", "kim@school.test");
        let c = ledger.add_user(Role::Student, "Jo", "Park", "jo@school.test");
        ledger.award(teacher.id, a.id, 2, t0()).unwrap();
        ledger.award(teacher.id, b.id, 9, t0()).unwrap();
        ledger.award(teacher.id, c.id, 2, t0()).unwrap();

        let board = leaderboard(&ledger, 2).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!((board[0].rank, board[0].user_id, board[0].points), (1, b.id, 9));
        assert_eq!((board[1].rank, board[1].user_id), (2, a.id));
        assert_eq!(board[1].name, "Sam Lee");
    }

    #[test]
    fn offline_ledger_fails_reads_and_sessions() {
        let ledger = Arc::new(MemoryLedger::new());
        let ctx = LedgerContext::new(ledger.clone());
        ctx.acquire().unwrap();
        assert_eq!(ledger.open_sessions(), 1);
        ctx.release();
        assert_eq!(ledger.open_sessions(), 0);

        ledger.set_offline(true);
        assert_eq!(
            ctx.acquire(),
            Err(TaskError::new("ledger unavailable: database unavailable"))
        );
        assert!(ledger.users_with_role(Role::Student).is_err());
    }
}
