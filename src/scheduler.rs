// scheduler.rs — 每日定时刷新
// 状态机：Idle → Armed → Running → Armed → … → Stopped
//
// 首次延迟在 start() 时计算并冻结：之后修改 SCHEDULE_TIME 不会影响已布置的定时器，
// 直到进程重启。

use crate::config::{ScheduleTime, Settings};
use crate::job::RefreshError;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// 首次延迟超过该值时，额外立即补跑一次
pub const CATCH_UP_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// 首次触发之后的固定周期
pub const RECURRENCE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// 由调度器周期执行的工作单元
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    async fn run(&self) -> Result<PathBuf, RefreshError>;
}

/// 一次布置的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRun {
    /// 首次触发的时间点
    pub target: DateTime<FixedOffset>,
    /// 距首次触发的延迟
    pub delay: Duration,
    /// 之后的重复周期
    pub recurrence: Duration,
}

impl ScheduledRun {
    pub fn needs_catch_up(&self) -> bool {
        self.delay > CATCH_UP_THRESHOLD
    }
}

/// 计算下一次执行：今天的 HH:MM，若已过（含恰好等于）则取明天
pub fn plan_next_run<Tz: TimeZone>(now: &DateTime<Tz>, at: ScheduleTime) -> ScheduledRun {
    let tz = now.timezone();
    let today = now.date_naive();

    let mut target = local_at(&tz, today, at);
    if target <= *now {
        let tomorrow = today.succ_opt().unwrap_or(today);
        target = local_at(&tz, tomorrow, at);
    }

    let delay = target
        .clone()
        .signed_duration_since(now)
        .to_std()
        .unwrap_or_default();

    ScheduledRun {
        target: target.fixed_offset(),
        delay,
        recurrence: RECURRENCE,
    }
}

/// 某天本地时间 HH:MM 对应的时刻；夏令时跳过的时刻顺延一小时
fn local_at<Tz: TimeZone>(tz: &Tz, date: NaiveDate, at: ScheduleTime) -> DateTime<Tz> {
    let naive = date
        .and_hms_opt(at.hour, at.minute, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

struct Inner {
    state: SchedulerState,
    cancel: Option<watch::Sender<bool>>,
}

/// 每日定时器
///
/// 同一时刻最多只有一次定时执行在进行中；手动触发的执行不受它约束。
pub struct Scheduler {
    task: Arc<dyn ScheduledTask>,
    inner: Arc<Mutex<Inner>>,
}

impl Scheduler {
    pub fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Idle,
                cancel: None,
            })),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    /// 按配置的时间和时区布置定时器
    pub fn start(&self, settings: &Settings) -> Result<ScheduledRun, SchedulerError> {
        let run = match settings.time_zone() {
            Some(tz) => plan_next_run(&Utc::now().with_timezone(&tz), settings.schedule_time),
            None => plan_next_run(&Local::now(), settings.schedule_time),
        };
        self.arm(run)
    }

    /// 按已计算好的计划布置定时器
    pub fn arm(&self, run: ScheduledRun) -> Result<ScheduledRun, SchedulerError> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SchedulerState::Armed | SchedulerState::Running) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        inner.cancel = Some(cancel_tx);
        inner.state = SchedulerState::Armed;
        drop(inner);

        info!(
            "next wallpaper refresh at {} (in {}m)",
            run.target,
            run.delay.as_secs() / 60
        );

        if run.needs_catch_up() {
            info!("next run is more than an hour away, refreshing now as a catch-up");
            let task = Arc::clone(&self.task);
            tokio::spawn(async move { execute(task.as_ref(), "catch-up").await });
        }

        tokio::spawn(run_loop(
            Arc::clone(&self.task),
            Arc::clone(&self.inner),
            cancel_rx,
            run.delay,
            run.recurrence,
        ));

        Ok(run)
    }

    /// 取消所有未触发的定时器；重复调用无副作用，正在进行的执行不会被打断
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
            info!("scheduler stopped");
        }
        inner.state = SchedulerState::Stopped;
    }
}

async fn run_loop(
    task: Arc<dyn ScheduledTask>,
    inner: Arc<Mutex<Inner>>,
    mut cancel: watch::Receiver<bool>,
    first_delay: Duration,
    period: Duration,
) {
    let mut delay = first_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {
                debug!("pending refresh timer cancelled");
                return;
            }
        }

        if !transition(&inner, SchedulerState::Armed, SchedulerState::Running) {
            return;
        }
        execute(task.as_ref(), "scheduled").await;
        if !transition(&inner, SchedulerState::Running, SchedulerState::Armed) {
            return;
        }
        delay = period;
    }
}

/// 仅当当前状态为 `from` 时切换；stop() 之后返回 false
fn transition(inner: &Mutex<Inner>, from: SchedulerState, to: SchedulerState) -> bool {
    let mut inner = inner.lock();
    if inner.state != from {
        return false;
    }
    inner.state = to;
    true
}

/// 执行一次并记录结果；失败不会中断后续调度
async fn execute(task: &dyn ScheduledTask, label: &str) {
    match task.run().await {
        Ok(path) => info!("{label} refresh finished: {}", path.display()),
        Err(e) => error!("{label} refresh failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GenerateError;
    use chrono_tz::Tz;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTask {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        async fn run(&self) -> Result<PathBuf, RefreshError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenerateError::Other("boom".to_string()).into());
            }
            Ok(PathBuf::from("wallpaper.png"))
        }
    }

    fn nine() -> ScheduleTime {
        ScheduleTime::new(9, 0).unwrap()
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    #[test]
    fn before_target_arms_for_today() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let run = plan_next_run(&now, nine());
        assert_eq!(run.delay, hours(1));
        assert_eq!(run.target, Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap());
        assert!(!run.needs_catch_up());
    }

    #[test]
    fn after_target_arms_for_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        let run = plan_next_run(&now, nine());
        assert_eq!(run.delay, hours(10));
        assert_eq!(run.target, Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap());
        assert!(run.needs_catch_up());
    }

    #[test]
    fn exactly_at_target_waits_a_full_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(plan_next_run(&now, nine()).delay, hours(24));
    }

    #[test]
    fn target_is_computed_in_the_configured_zone() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        // 00:30 UTC = 08:30 上海
        let now = Utc
            .with_ymd_and_hms(2024, 6, 1, 0, 30, 0)
            .unwrap()
            .with_timezone(&tz);
        let run = plan_next_run(&now, nine());
        assert_eq!(run.delay, Duration::from_secs(30 * 60));
        assert_eq!(run.target.offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn skipped_local_time_moves_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2024-03-10 02:30 本地时间不存在
        let now = tz.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let run = plan_next_run(&now, ScheduleTime::new(2, 30).unwrap());
        assert_eq!(run.target.naive_local().to_string(), "2024-03-10 03:30:00");
    }

    #[tokio::test(start_paused = true)]
    async fn short_delay_has_no_catch_up_and_recurs_daily() {
        let task = Arc::new(CountingTask::default());
        let scheduler = Scheduler::new(task.clone());
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(hours(24)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn long_delay_triggers_one_catch_up_run() {
        let task = Arc::new(CountingTask::default());
        let scheduler = Scheduler::new(task.clone());
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 23, 0, 0).unwrap();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(hours(10)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_schedule() {
        let task = Arc::new(CountingTask {
            fail: true,
            ..CountingTask::default()
        });
        let scheduler = Scheduler::new(task.clone());
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();

        tokio::time::sleep(hours(1) + hours(24) + Duration::from_secs(60)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer_and_is_idempotent() {
        let task = Arc::new(CountingTask::default());
        let scheduler = Scheduler::new(task.clone());
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();

        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        tokio::time::sleep(hours(48)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_plans_in_the_configured_zone() {
        let scheduler = Scheduler::new(Arc::new(CountingTask::default()));
        let settings = Settings {
            schedule_time: ScheduleTime::new(6, 45).unwrap(),
            timezone: "Asia/Kolkata".to_string(),
            ..Settings::default()
        };

        let run = scheduler.start(&settings).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
        // +05:30，没有夏令时
        assert_eq!(run.target.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(run.target.naive_local().time().to_string(), "06:45:00");
        assert!(run.delay > Duration::ZERO && run.delay <= RECURRENCE);
        assert!(run.target.with_timezone(&Utc) > Utc::now());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cannot_start_twice_but_can_restart_after_stop() {
        let scheduler = Scheduler::new(Arc::new(CountingTask::default()));
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();
        assert!(matches!(
            scheduler.arm(plan_next_run(&now, nine())),
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop();
        scheduler.arm(plan_next_run(&now, nine())).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Armed);
    }
}
