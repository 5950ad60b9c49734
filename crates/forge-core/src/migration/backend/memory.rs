//! 인메모리 백엔드.
//!
//! 테이블/컬럼/nullable/제약조건/인덱스/행 수만 모델링하는 작은 DDL 해석기입니다.
//! 트랜잭션은 스냅샷 복사로 구현하며, 실행된 문장 로그와 실패/지연 주입을
//! 제공하여 러너의 원자성, 멱등성, 타임아웃 동작을 DB 없이 검증할 수 있습니다.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::MigrationBackend;
use crate::error::{MigrateError, Result};
use crate::migration::models::{MigrationRecord, TableRef};
use crate::migration::tokens::{split_top_level, tokenize, Cursor, Token, TokenKind};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    name: String,
    nullable: bool,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<Column>,
    constraints: BTreeSet<String>,
    rows: i64,
}

impl Table {
    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }
}

/// 커밋된 (또는 트랜잭션 작업 중인) 데이터베이스 상태
#[derive(Debug, Clone, Default)]
struct Database {
    tables: BTreeMap<String, Table>,
    /// 인덱스명 → 테이블명
    indexes: BTreeMap<String, String>,
    records: BTreeMap<String, MigrationRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: Database,
    /// lock key → 보유 세션 id
    locks: HashMap<i64, u64>,
    executed: Vec<String>,
    fail_on: Vec<String>,
    delay_on: Vec<(String, Duration)>,
    next_session: u64,
}

/// 인메모리 마이그레이션 백엔드.
///
/// [`MemoryBackend::sibling`] 으로 같은 데이터베이스를 공유하는 다른 세션을
/// 만들 수 있습니다 (락 경합 테스트용).
#[derive(Debug)]
pub struct MemoryBackend {
    session: u64,
    shared: Arc<Mutex<Shared>>,
    tx: Option<Database>,
    /// 지연 중 취소된 문장이 서버에서 끝나는 시각
    in_flight: Option<Instant>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            session: 0,
            shared: Arc::new(Mutex::new(Shared {
                next_session: 1,
                ..Shared::default()
            })),
            tx: None,
            in_flight: None,
        }
    }

    /// 같은 데이터베이스를 보는 새 세션
    pub fn sibling(&self) -> Self {
        let session = {
            let mut shared = lock(&self.shared);
            let id = shared.next_session;
            shared.next_session += 1;
            id
        };
        Self {
            session,
            shared: Arc::clone(&self.shared),
            tx: None,
            in_flight: None,
        }
    }

    /// SQL 에 `pattern` 이 포함되면 실행 실패
    pub fn fail_on(&self, pattern: impl Into<String>) {
        lock(&self.shared).fail_on.push(pattern.into());
    }

    /// SQL 에 `pattern` 이 포함되면 실행 전 지연
    pub fn delay_on(&self, pattern: impl Into<String>, delay: Duration) {
        lock(&self.shared).delay_on.push((pattern.into(), delay));
    }

    /// 실행 시도된 모든 SQL (실패 포함, 롤백과 무관)
    pub fn executed(&self) -> Vec<String> {
        lock(&self.shared).executed.clone()
    }

    /// 커밋된 추적 레코드
    pub fn records(&self) -> Vec<MigrationRecord> {
        lock(&self.shared).committed.records.values().cloned().collect()
    }

    /// 추적 레코드 직접 기록 (중단된 실행 등 재현용)
    pub fn seed_record(&self, record: MigrationRecord) {
        lock(&self.shared)
            .committed
            .records
            .insert(record.filename.clone(), record);
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.shared).committed.tables.contains_key(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        lock(&self.shared)
            .committed
            .tables
            .get(table)
            .is_some_and(|t| t.column(column).is_some())
    }

    pub fn has_constraint(&self, table: &str, constraint: &str) -> bool {
        lock(&self.shared)
            .committed
            .tables
            .get(table)
            .is_some_and(|t| t.constraints.contains(constraint))
    }

    pub fn row_count_of(&self, table: &str) -> Option<i64> {
        lock(&self.shared).committed.tables.get(table).map(|t| t.rows)
    }

    /// 조회용 상태 (트랜잭션 중이면 작업 사본)
    fn view<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        match &self.tx {
            Some(db) => f(db),
            None => f(&lock(&self.shared).committed),
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // 테스트 패닉으로 poison 되어도 상태는 그대로 사용
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn db_error(message: impl Into<String>) -> MigrateError {
    MigrateError::Database(sqlx::Error::Protocol(message.into()))
}

fn table_key(table: &TableRef) -> String {
    table.name.to_lowercase()
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_tracking_table(&mut self) -> Result<()> {
        Ok(())
    }

    async fn load_records(&mut self) -> Result<Vec<MigrationRecord>> {
        Ok(self.records())
    }

    async fn upsert_record(&mut self, record: &MigrationRecord) -> Result<()> {
        match self.tx.as_mut() {
            Some(db) => {
                db.records.insert(record.filename.clone(), record.clone());
            }
            None => self.seed_record(record.clone()),
        }
        Ok(())
    }

    async fn acquire_lock(&mut self, key: i64, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let acquired = {
                let mut shared = lock(&self.shared);
                match shared.locks.get(&key) {
                    Some(holder) if *holder != self.session => false,
                    _ => {
                        shared.locks.insert(key, self.session);
                        true
                    }
                }
            };
            if acquired {
                debug!(lock_key = key, session = self.session, "메모리 락 획득");
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(MigrateError::Lock { key, waited });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    async fn release_lock(&mut self, key: i64) -> Result<()> {
        let mut shared = lock(&self.shared);
        if shared.locks.get(&key) == Some(&self.session) {
            shared.locks.remove(&key);
        } else {
            warn!(lock_key = key, "해제할 락이 없음");
        }
        Ok(())
    }

    async fn begin(&mut self, _statement_timeout: Option<Duration>) -> Result<()> {
        let snapshot = lock(&self.shared).committed.clone();
        self.tx = Some(snapshot);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let (delay, injected) = {
            let mut shared = lock(&self.shared);
            shared.executed.push(sql.to_string());
            let delay = shared
                .delay_on
                .iter()
                .find(|(p, _)| sql.contains(p.as_str()))
                .map(|(_, d)| *d);
            let injected = shared.fail_on.iter().any(|p| sql.contains(p.as_str()));
            (delay, injected)
        };

        if let Some(delay) = delay {
            // 이 future 가 취소되면 in_flight 가 남아 이후 롤백이 문장 종료를 기다림
            self.in_flight = Some(Instant::now() + delay);
            tokio::time::sleep(delay).await;
            self.in_flight = None;
        }
        if injected {
            return Err(db_error("injected failure"));
        }

        let db = self
            .tx
            .as_mut()
            .ok_or_else(|| db_error("execute called without an open transaction"))?;
        db.apply(sql).map_err(db_error)
    }

    async fn commit(&mut self) -> Result<()> {
        let db = self
            .tx
            .take()
            .ok_or_else(|| db_error("commit called without an open transaction"))?;
        lock(&self.shared).committed = db;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(until) = self.in_flight.take() {
            tokio::time::sleep_until(until.into()).await;
        }
        self.tx = None;
        Ok(())
    }

    fn abandon(&mut self) {
        self.in_flight = None;
        self.tx = None;
    }

    async fn table_exists(&mut self, table: &TableRef) -> Result<bool> {
        let key = table_key(table);
        Ok(self.view(|db| db.tables.contains_key(&key)))
    }

    async fn column_nullable(&mut self, table: &TableRef, column: &str) -> Result<Option<bool>> {
        let key = table_key(table);
        Ok(self.view(|db| {
            db.tables
                .get(&key)
                .and_then(|t| t.column(column))
                .map(|c| c.nullable)
        }))
    }

    async fn constraint_exists(&mut self, table: &TableRef, constraint: &str) -> Result<bool> {
        let key = table_key(table);
        Ok(self.view(|db| {
            db.tables
                .get(&key)
                .is_some_and(|t| t.constraints.contains(constraint))
        }))
    }

    async fn row_count(&mut self, table: &TableRef) -> Result<Option<i64>> {
        let key = table_key(table);
        Ok(self.view(|db| db.tables.get(&key).map(|t| t.rows)))
    }
}

type ApplyResult = std::result::Result<u64, String>;

fn syntax_error(near: Option<&Token>) -> String {
    match near {
        Some(t) => format!("syntax error at or near \"{}\"", t.value.to_uppercase()),
        None => "syntax error at end of input".to_string(),
    }
}

fn missing_relation(name: &str) -> String {
    format!("relation \"{}\" does not exist", name)
}

impl Database {
    /// 문장 하나 해석
    fn apply(&mut self, sql: &str) -> ApplyResult {
        let tokens = tokenize(sql);
        let mut cur = Cursor::new(&tokens);
        let Some(first) = cur.peek() else {
            return Ok(0);
        };

        match first.value.as_str() {
            "create" if first.kind == TokenKind::Word => {
                cur.bump();
                self.apply_create(&mut cur)
            }
            "alter" if first.kind == TokenKind::Word => {
                cur.bump();
                if cur.eat_kw("table") {
                    self.apply_alter_table(&mut cur)
                } else {
                    Ok(0)
                }
            }
            "drop" if first.kind == TokenKind::Word => {
                cur.bump();
                self.apply_drop(&mut cur)
            }
            "insert" if first.kind == TokenKind::Word => self.apply_insert(&mut cur),
            "update" | "delete" | "truncate" if first.kind == TokenKind::Word => {
                self.apply_dml(&mut cur)
            }
            "do" | "select" | "comment" | "grant" | "revoke" | "set" | "analyze" | "refresh"
            | "reindex" | "vacuum" | "with" | "begin" | "commit" | "end" | "start"
            | "rollback" | "notify" | "perform"
                if first.kind == TokenKind::Word =>
            {
                Ok(0)
            }
            _ => Err(syntax_error(Some(first))),
        }
    }

    fn apply_create(&mut self, cur: &mut Cursor<'_>) -> ApplyResult {
        cur.eat_kws(&["or", "replace"]);
        cur.eat_kw("unique");
        let temporary = cur.eat_kw("temp") || cur.eat_kw("temporary") || cur.eat_kw("unlogged");

        if cur.eat_kw("table") {
            let if_not_exists = cur.eat_kws(&["if", "not", "exists"]);
            let table = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
            return self.create_table(&table, if_not_exists, cur.rest());
        }
        if cur.eat_kw("index") {
            if cur.eat_kw("concurrently") {
                return Err(
                    "CREATE INDEX CONCURRENTLY cannot run inside a transaction block".to_string(),
                );
            }
            let if_not_exists = cur.eat_kws(&["if", "not", "exists"]);
            let name = if cur.peek_kw("on") { None } else { cur.ident() };
            if !cur.eat_kw("on") {
                return Err(syntax_error(cur.peek()));
            }
            cur.eat_kw("only");
            let table = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
            let key = table_key(&table);
            if !self.tables.contains_key(&key) {
                return Err(missing_relation(&table.name));
            }
            if let Some(name) = name {
                if self.indexes.contains_key(&name) {
                    if if_not_exists {
                        return Ok(0);
                    }
                    return Err(format!("relation \"{}\" already exists", name));
                }
                self.indexes.insert(name, key);
            }
            return Ok(0);
        }
        if temporary {
            return Err(syntax_error(cur.peek()));
        }

        // VIEW / FUNCTION / TRIGGER / TYPE / EXTENSION / SEQUENCE 등은 스키마 모델 밖
        match cur.peek() {
            Some(t) if t.kind == TokenKind::Word => Ok(0),
            other => Err(syntax_error(other)),
        }
    }

    fn create_table(&mut self, table: &TableRef, if_not_exists: bool, rest: &[Token]) -> ApplyResult {
        let key = table_key(table);
        if self.tables.contains_key(&key) {
            if if_not_exists {
                return Ok(0);
            }
            return Err(format!("relation \"{}\" already exists", table.name));
        }

        let body = paren_body(rest).ok_or_else(|| syntax_error(rest.first()))?;
        let mut new_table = Table::default();
        for element in split_top_level(body) {
            add_table_element(&mut new_table, &table.name, element)?;
        }
        self.tables.insert(key, new_table);
        Ok(0)
    }

    fn apply_alter_table(&mut self, cur: &mut Cursor<'_>) -> ApplyResult {
        let if_exists = cur.eat_kws(&["if", "exists"]);
        cur.eat_kw("only");
        let table_ref = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
        let key = table_key(&table_ref);

        if cur.eat_kw("rename") {
            if cur.eat_kw("to") {
                let new_name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
                let table = self
                    .tables
                    .remove(&key)
                    .ok_or_else(|| missing_relation(&table_ref.name))?;
                self.tables.insert(new_name, table);
                return Ok(0);
            }
            cur.eat_kw("column");
            let from = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
            if !cur.eat_kw("to") {
                return Err(syntax_error(cur.peek()));
            }
            let to = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
            let table = self
                .tables
                .get_mut(&key)
                .ok_or_else(|| missing_relation(&table_ref.name))?;
            let column = table.column_mut(&from).ok_or_else(|| {
                format!("column \"{}\" does not exist", from)
            })?;
            column.name = to;
            return Ok(0);
        }

        let Some(table) = self.tables.get_mut(&key) else {
            if if_exists {
                return Ok(0);
            }
            return Err(missing_relation(&table_ref.name));
        };

        // 전체가 성공해야 반영
        let mut staged = table.clone();
        for action in split_top_level(cur.rest()) {
            alter_action(&mut staged, &table_ref.name, action)?;
        }
        *table = staged;
        Ok(0)
    }

    fn apply_drop(&mut self, cur: &mut Cursor<'_>) -> ApplyResult {
        if cur.eat_kw("table") {
            let if_exists = cur.eat_kws(&["if", "exists"]);
            for part in split_top_level(cur.rest()) {
                let mut names = Cursor::new(part);
                let table = names.qualified_name().ok_or_else(|| syntax_error(part.first()))?;
                let key = table_key(&table);
                if self.tables.remove(&key).is_none() && !if_exists {
                    return Err(missing_relation(&table.name));
                }
                self.indexes.retain(|_, t| t != &key);
            }
            return Ok(0);
        }
        if cur.eat_kw("index") {
            if cur.eat_kw("concurrently") {
                return Err(
                    "DROP INDEX CONCURRENTLY cannot run inside a transaction block".to_string(),
                );
            }
            let if_exists = cur.eat_kws(&["if", "exists"]);
            let index = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
            if self.indexes.remove(&index.name).is_none() && !if_exists {
                return Err(format!("index \"{}\" does not exist", index.name));
            }
            return Ok(0);
        }
        match cur.peek() {
            Some(t) if t.kind == TokenKind::Word => Ok(0),
            other => Err(syntax_error(other)),
        }
    }

    fn apply_insert(&mut self, cur: &mut Cursor<'_>) -> ApplyResult {
        cur.bump();
        if !cur.eat_kw("into") {
            return Err(syntax_error(cur.peek()));
        }
        let table_ref = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
        let table = self
            .tables
            .get_mut(&table_key(&table_ref))
            .ok_or_else(|| missing_relation(&table_ref.name))?;

        let rest = cur.rest();
        let Some(values_at) = rest.iter().position(|t| t.is_kw("values")) else {
            // INSERT ... SELECT 는 행 수를 알 수 없음
            return Ok(0);
        };

        let mut depth = 0;
        let mut rows = 0i64;
        for t in &rest[values_at + 1..] {
            match t.kind {
                TokenKind::LParen => {
                    if depth == 0 {
                        rows += 1;
                    }
                    depth += 1;
                }
                TokenKind::RParen => depth -= 1,
                TokenKind::Word if depth == 0 && t.value == "on" => break,
                _ => {}
            }
        }
        table.rows += rows;
        Ok(rows as u64)
    }

    fn apply_dml(&mut self, cur: &mut Cursor<'_>) -> ApplyResult {
        let verb = cur.bump().map(|t| t.value.clone()).unwrap_or_default();
        if verb == "delete" && !cur.eat_kw("from") {
            return Err(syntax_error(cur.peek()));
        }
        cur.eat_kw("table");
        cur.eat_kw("only");
        let table_ref = cur.qualified_name().ok_or_else(|| syntax_error(cur.peek()))?;
        let table = self
            .tables
            .get_mut(&table_key(&table_ref))
            .ok_or_else(|| missing_relation(&table_ref.name))?;

        let has_where = cur.rest().iter().any(|t| t.is_kw("where"));
        match verb.as_str() {
            "delete" | "truncate" if !has_where => {
                let removed = table.rows;
                table.rows = 0;
                Ok(removed as u64)
            }
            _ => Ok(0),
        }
    }
}

/// `( ... )` 최상위 괄호 안쪽 토큰
fn paren_body(tokens: &[Token]) -> Option<&[Token]> {
    if tokens.first()?.kind != TokenKind::LParen {
        return None;
    }
    let mut depth = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(&tokens[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 괄호 안 식별자 목록 (`(a, b)`)
fn ident_list(tokens: &[Token]) -> Vec<String> {
    paren_body(tokens)
        .map(|body| {
            body.iter()
                .filter(|t| t.is_ident())
                .map(|t| t.value.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// 제약 본문 다음 토큰부터 (`UNIQUE (a)` 의 `(a)`)
fn after_keywords<'a>(element: &'a [Token], kws: &[&str]) -> &'a [Token] {
    let skip = kws.len().min(element.len());
    &element[skip..]
}

/// CREATE TABLE 의 컬럼 정의 또는 테이블 제약
fn add_table_element(table: &mut Table, table_name: &str, element: &[Token]) -> std::result::Result<(), String> {
    let mut cur = Cursor::new(element);

    if cur.eat_kw("constraint") {
        let name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
        apply_constraint_body(table, cur.rest());
        table.constraints.insert(name);
        return Ok(());
    }
    if let Some(name) = implicit_constraint_name(table_name, element) {
        apply_constraint_body(table, element);
        table.constraints.insert(name);
        return Ok(());
    }
    if element.first().is_some_and(|t| t.is_kw("check") || t.is_kw("exclude") || t.is_kw("like")) {
        return Ok(());
    }

    let column = parse_column(table_name, element, &mut table.constraints)?;
    if table.column(&column.name).is_some() {
        return Err(format!("column \"{}\" specified more than once", column.name));
    }
    table.columns.push(column);
    Ok(())
}

/// 테이블 수준 PRIMARY KEY / UNIQUE / FOREIGN KEY 의 자동 이름
fn implicit_constraint_name(table_name: &str, element: &[Token]) -> Option<String> {
    let first = element.first()?;
    if first.is_kw("primary") {
        return Some(format!("{}_pkey", table_name));
    }
    if first.is_kw("unique") {
        let cols = ident_list(after_keywords(element, &["unique"]));
        return Some(format!("{}_{}_key", table_name, cols.join("_")));
    }
    if first.is_kw("foreign") {
        let cols = ident_list(after_keywords(element, &["foreign", "key"]));
        return Some(format!("{}_{}_fkey", table_name, cols.join("_")));
    }
    None
}

/// PRIMARY KEY 제약이면 대상 컬럼을 NOT NULL 로
fn apply_constraint_body(table: &mut Table, body: &[Token]) {
    if body.first().is_some_and(|t| t.is_kw("primary")) {
        for col in ident_list(after_keywords(body, &["primary", "key"])) {
            if let Some(column) = table.column_mut(&col) {
                column.nullable = false;
            }
        }
    }
}

/// 컬럼 정의 파싱 (인라인 제약은 constraints 에 추가)
fn parse_column(
    table_name: &str,
    element: &[Token],
    constraints: &mut BTreeSet<String>,
) -> std::result::Result<Column, String> {
    let mut cur = Cursor::new(element);
    let name = cur.ident().ok_or_else(|| syntax_error(element.first()))?;
    if cur.peek().is_none() {
        return Err(syntax_error(None));
    }

    let mut nullable = true;
    let mut pending_name: Option<String> = None;
    let mut depth = 0;
    while let Some(t) = cur.bump() {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            _ if depth > 0 => {}
            TokenKind::Word => match t.value.as_str() {
                "constraint" => pending_name = cur.ident(),
                "not" if cur.peek_kw("null") => {
                    cur.bump();
                    nullable = false;
                }
                "primary" if cur.peek_kw("key") => {
                    cur.bump();
                    nullable = false;
                    constraints.insert(
                        pending_name
                            .take()
                            .unwrap_or_else(|| format!("{}_pkey", table_name)),
                    );
                }
                "unique" => {
                    constraints.insert(
                        pending_name
                            .take()
                            .unwrap_or_else(|| format!("{}_{}_key", table_name, name)),
                    );
                }
                "references" => {
                    constraints.insert(
                        pending_name
                            .take()
                            .unwrap_or_else(|| format!("{}_{}_fkey", table_name, name)),
                    );
                }
                "check" => {
                    constraints.insert(
                        pending_name
                            .take()
                            .unwrap_or_else(|| format!("{}_{}_check", table_name, name)),
                    );
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(Column { name, nullable })
}

/// ALTER TABLE 동작 하나
fn alter_action(table: &mut Table, table_name: &str, action: &[Token]) -> std::result::Result<(), String> {
    let mut cur = Cursor::new(action);

    if cur.eat_kw("add") {
        if cur.eat_kw("constraint") {
            // PostgreSQL 은 ADD CONSTRAINT IF NOT EXISTS 를 지원하지 않음
            let name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
            let body = cur.rest();
            if body.is_empty() || (name == "if" && cur.peek_kw("not")) {
                return Err(syntax_error(cur.peek()));
            }
            if table.constraints.contains(&name) {
                return Err(format!(
                    "constraint \"{}\" for relation \"{}\" already exists",
                    name, table_name
                ));
            }
            apply_constraint_body(table, body);
            table.constraints.insert(name);
            return Ok(());
        }
        if let Some(name) = implicit_constraint_name(table_name, cur.rest()) {
            apply_constraint_body(table, cur.rest());
            table.constraints.insert(name);
            return Ok(());
        }

        cur.eat_kw("column");
        let if_not_exists = cur.eat_kws(&["if", "not", "exists"]);
        let column = parse_column(table_name, cur.rest(), &mut table.constraints)?;
        if table.column(&column.name).is_some() {
            if if_not_exists {
                return Ok(());
            }
            return Err(format!(
                "column \"{}\" of relation \"{}\" already exists",
                column.name, table_name
            ));
        }
        table.columns.push(column);
        return Ok(());
    }

    if cur.eat_kw("drop") {
        if cur.eat_kw("constraint") {
            let if_exists = cur.eat_kws(&["if", "exists"]);
            let name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
            if !table.constraints.remove(&name) && !if_exists {
                return Err(format!(
                    "constraint \"{}\" of relation \"{}\" does not exist",
                    name, table_name
                ));
            }
            return Ok(());
        }
        cur.eat_kw("column");
        let if_exists = cur.eat_kws(&["if", "exists"]);
        let name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
        let before = table.columns.len();
        table.columns.retain(|c| c.name != name);
        if table.columns.len() == before && !if_exists {
            return Err(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                name, table_name
            ));
        }
        return Ok(());
    }

    if cur.eat_kw("alter") {
        cur.eat_kw("column");
        let name = cur.ident().ok_or_else(|| syntax_error(cur.peek()))?;
        let column = table.column_mut(&name).ok_or_else(|| {
            format!("column \"{}\" of relation \"{}\" does not exist", name, table_name)
        })?;
        if cur.eat_kws(&["drop", "not", "null"]) {
            column.nullable = true;
        } else if cur.eat_kws(&["set", "not", "null"]) {
            column.nullable = false;
        } else if cur.peek().is_none() {
            return Err(syntax_error(None));
        }
        return Ok(());
    }

    match cur.peek() {
        // OWNER TO, ENABLE ROW LEVEL SECURITY 등
        Some(t) if t.kind == TokenKind::Word => Ok(()),
        other => Err(syntax_error(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(backend: &mut MemoryBackend, sql: &str) -> Result<u64> {
        backend.begin(None).await?;
        match backend.execute(sql).await {
            Ok(n) => {
                backend.commit().await?;
                Ok(n)
            }
            Err(e) => {
                backend.rollback().await?;
                Err(e)
            }
        }
    }

    #[tokio::test]
    async fn test_create_table_tracks_columns_and_constraints() {
        let mut db = MemoryBackend::new();
        run(
            &mut db,
            "CREATE TABLE users (
                id UUID PRIMARY KEY,
                email TEXT NOT NULL,
                nickname VARCHAR(50),
                CONSTRAINT users_nickname_len CHECK (length(nickname) > 2)
            )",
        )
        .await
        .unwrap();

        let users = TableRef::new("users");
        assert!(db.has_table("users"));
        assert_eq!(db.column_nullable(&users, "id").await.unwrap(), Some(false));
        assert_eq!(db.column_nullable(&users, "email").await.unwrap(), Some(false));
        assert_eq!(db.column_nullable(&users, "nickname").await.unwrap(), Some(true));
        assert!(db.has_constraint("users", "users_pkey"));
        assert!(db.has_constraint("users", "users_nickname_len"));

        let err = run(&mut db, "CREATE TABLE users (id INT)").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        run(&mut db, "CREATE TABLE IF NOT EXISTS users (id INT)").await.unwrap();
    }

    #[tokio::test]
    async fn test_add_constraint_if_not_exists_is_syntax_error() {
        let mut db = MemoryBackend::new();
        run(&mut db, "CREATE TABLE users (id INT, email TEXT)").await.unwrap();
        let err = run(
            &mut db,
            "ALTER TABLE users ADD CONSTRAINT IF NOT EXISTS users_email_key UNIQUE (email)",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("syntax error at or near \"NOT\""));

        run(&mut db, "ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email)")
            .await
            .unwrap();
        assert!(db.has_constraint("users", "users_email_key"));
        let err = run(&mut db, "ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email)")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let mut db = MemoryBackend::new();
        db.begin(None).await.unwrap();
        db.execute("CREATE TABLE a (id INT)").await.unwrap();
        assert!(db.table_exists(&TableRef::new("a")).await.unwrap());
        db.rollback().await.unwrap();
        assert!(!db.has_table("a"));
        assert!(!db.table_exists(&TableRef::new("a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_statement_blocks_rollback_until_abandoned() {
        let mut db = MemoryBackend::new();
        db.delay_on("pg_sleep", Duration::from_millis(300));

        db.begin(None).await.unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), db.execute("SELECT pg_sleep(1)")).await;
        assert!(cancelled.is_err());
        let started = Instant::now();
        db.rollback().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        db.begin(None).await.unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), db.execute("SELECT pg_sleep(1)")).await;
        assert!(cancelled.is_err());
        let started = Instant::now();
        db.abandon();
        db.rollback().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_insert_counts_rows_and_unknown_keyword_fails() {
        let mut db = MemoryBackend::new();
        run(&mut db, "CREATE TABLE plans (id INT, name TEXT)").await.unwrap();
        let n = run(
            &mut db,
            "INSERT INTO plans (id, name) VALUES (1, 'free'), (2, 'pro (beta)') ON CONFLICT (id) DO NOTHING",
        )
        .await
        .unwrap();
        assert_eq!(n, 2);
        assert_eq!(db.row_count_of("plans"), Some(2));

        let err = run(&mut db, "CREAT TABLE oops (id INT)").await.unwrap_err();
        assert!(err.to_string().contains("syntax error at or near \"CREAT\""));
        let err = run(&mut db, "INSERT INTO missing VALUES (1)").await.unwrap_err();
        assert!(err.to_string().contains("relation \"missing\" does not exist"));
    }

    #[tokio::test]
    async fn test_concurrently_rejected_in_transaction() {
        let mut db = MemoryBackend::new();
        run(&mut db, "CREATE TABLE posts (id INT)").await.unwrap();
        let err = run(&mut db, "CREATE INDEX CONCURRENTLY idx_posts ON posts (id)")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot run inside a transaction block"));
    }

    #[tokio::test]
    async fn test_lock_contention_between_sessions() {
        let mut first = MemoryBackend::new();
        let mut second = first.sibling();

        first.acquire_lock(7, Duration::from_millis(10)).await.unwrap();
        let err = second
            .acquire_lock(7, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Lock { key: 7, .. }));

        first.release_lock(7).await.unwrap();
        second.acquire_lock(7, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection_is_logged() {
        let mut db = MemoryBackend::new();
        db.fail_on("boom");
        let err = run(&mut db, "SELECT 'boom'").await.unwrap_err();
        assert!(matches!(err, MigrateError::Database(_)));
        assert_eq!(db.executed(), vec!["SELECT 'boom'".to_string()]);
    }
}
