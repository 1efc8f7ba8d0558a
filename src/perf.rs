// ==========================================
// FWC 对账引擎 - 性能统计
// ==========================================
// 职责: SQL 计数 + 慢查询日志 + 每个操作的耗时记录
// 约束: 计数器是线程局部的,只统计创建 Guard 的线程上执行的 SQL
//       异步操作中 Guard 只能包住同步片段（measure / measure_blocking）
// ==========================================

use rusqlite::Connection;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinError;

/// SQL 统计开关
pub const ENV_PERF_SQL: &str = "FWC_RECON_PERF_SQL";
/// 慢 SQL 阈值（毫秒）
pub const ENV_SLOW_SQL_MS: &str = "FWC_RECON_SLOW_SQL_MS";

const SLOW_SQL_MS_DEBUG: u64 = 50;
const SLOW_SQL_MS_RELEASE: u64 = 200;
const SLOW_SQL_LOG_LEN: usize = 420;

static SQL_STATS_ENABLED: AtomicBool = AtomicBool::new(false);
static SLOW_SQL_MS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // 当前线程上未结束的 Guard 数
    static OPEN_GUARDS: Cell<u32> = Cell::new(0);
    static THREAD_SQL: Cell<u64> = Cell::new(0);
    static THREAD_SLOW_SQL: Cell<u64> = Cell::new(0);
}

fn guard_active() -> bool {
    OPEN_GUARDS.with(|d| d.get() > 0)
}

fn bump(counter: &'static std::thread::LocalKey<Cell<u64>>) {
    counter.with(|c| c.set(c.get().saturating_add(1)));
}

fn switch_on(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// 单行化并截断 SQL（按字符截断,避免切断多字节字符）
fn one_line_sql(sql: &str, max_chars: usize) -> String {
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}

// ==========================================
// SQLite trace / profile 回调
// ==========================================

/// 在连接上安装 SQL 计数与慢查询回调
///
/// # 开关
/// - `FWC_RECON_PERF_SQL`: 显式开关; 未设置时 Debug 开启、Release 关闭
/// - `FWC_RECON_SLOW_SQL_MS`: 慢 SQL 阈值,默认 Debug 50ms / Release 200ms
pub fn install_sqlite_tracing(conn: &mut Connection) {
    let enabled = std::env::var(ENV_PERF_SQL)
        .map(|v| switch_on(&v))
        .unwrap_or(cfg!(debug_assertions));
    SQL_STATS_ENABLED.store(enabled, Ordering::Relaxed);

    if !enabled {
        conn.trace(None);
        conn.profile(None);
        return;
    }

    let default_ms = if cfg!(debug_assertions) {
        SLOW_SQL_MS_DEBUG
    } else {
        SLOW_SQL_MS_RELEASE
    };
    let slow_ms = std::env::var(ENV_SLOW_SQL_MS)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_ms);
    SLOW_SQL_MS.store(slow_ms, Ordering::Relaxed);

    conn.trace(Some(on_sql_start));
    conn.profile(Some(on_sql_done));
}

fn on_sql_start(_sql: &str) {
    if SQL_STATS_ENABLED.load(Ordering::Relaxed) && guard_active() {
        bump(&THREAD_SQL);
    }
}

fn on_sql_done(sql: &str, duration: Duration) {
    if !SQL_STATS_ENABLED.load(Ordering::Relaxed) {
        return;
    }

    let threshold = SLOW_SQL_MS.load(Ordering::Relaxed);
    let ms = duration.as_millis() as u64;
    if threshold == 0 || ms < threshold {
        return;
    }

    tracing::warn!(
        target: "slow_sql",
        duration_ms = ms,
        sql = %one_line_sql(sql, SLOW_SQL_LOG_LEN),
        "slow sql"
    );
    if guard_active() {
        bump(&THREAD_SLOW_SQL);
    }
}

// ==========================================
// PerfStats / PerfGuard
// ==========================================

/// 一次操作的统计结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfStats {
    pub op: &'static str,
    pub elapsed_ms: u64,
    pub sql_count: u64,
    pub slow_sql_count: u64,
}

/// 操作统计 Guard: 结束时记录 target="perf" 日志
///
/// Guard 不可 Send: 线程局部计数要求它在创建线程上结束,
/// 因此也无法被持有跨越多线程运行时中的 `.await`。
pub struct PerfGuard {
    op: &'static str,
    start: Instant,
    sql_start: u64,
    slow_sql_start: u64,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl PerfGuard {
    pub fn new(op: &'static str) -> Self {
        OPEN_GUARDS.with(|d| d.set(d.get().saturating_add(1)));
        Self {
            op,
            start: Instant::now(),
            sql_start: THREAD_SQL.with(Cell::get),
            slow_sql_start: THREAD_SLOW_SQL.with(Cell::get),
            finished: false,
            _not_send: PhantomData,
        }
    }

    /// 当前累计值（不结束 Guard）
    pub fn stats(&self) -> PerfStats {
        PerfStats {
            op: self.op,
            elapsed_ms: self.start.elapsed().as_millis() as u64,
            sql_count: THREAD_SQL.with(Cell::get).saturating_sub(self.sql_start),
            slow_sql_count: THREAD_SLOW_SQL
                .with(Cell::get)
                .saturating_sub(self.slow_sql_start),
        }
    }

    /// 结束统计并返回结果
    pub fn finish(mut self) -> PerfStats {
        self.close()
    }

    fn close(&mut self) -> PerfStats {
        let stats = self.stats();
        if !self.finished {
            self.finished = true;
            tracing::info!(
                target: "perf",
                op = stats.op,
                elapsed_ms = stats.elapsed_ms,
                sql_count = stats.sql_count,
                slow_sql_count = stats.slow_sql_count,
                "done"
            );
            OPEN_GUARDS.with(|d| d.set(d.get().saturating_sub(1)));
        }
        stats
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        self.close();
    }
}

// ==========================================
// 包装辅助
// ==========================================

/// 在当前线程上统计一段同步代码
///
/// # 示例
/// ```ignore
/// let page = perf::measure("recon_list_batches", || repo.list_batches(None, 20, 0))?;
/// ```
pub fn measure<T>(op: &'static str, f: impl FnOnce() -> T) -> T {
    let guard = PerfGuard::new(op);
    let out = f();
    guard.finish();
    out
}

/// 在阻塞线程池中执行并统计（Guard 在执行线程上创建）
///
/// # 返回
/// - Err(JoinError): 任务 panic 或被取消
pub async fn measure_blocking<T, F>(op: &'static str, f: F) -> Result<T, JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || measure(op, f)).await
}
