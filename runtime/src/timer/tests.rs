use super::{CronError, CronExpr, Dispatcher, TimerQueue};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn next_timer(queue: &mut TimerQueue<u32>) -> super::Timer<u32> {
    timeout(Duration::from_secs(5), queue.recv())
        .await
        .expect("timer never fired")
        .expect("timer queue closed")
}

// ============================================================================
// One-shot timers
// ============================================================================

#[tokio::test]
async fn test_after_func_fires_on_owner() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);
    let mut fired = 0;

    let timer = dispatcher.after_func(Duration::from_millis(10), |n: &mut u32| *n += 1);
    assert!(timer.is_active());

    next_timer(&mut queue).await.cb(&mut fired);
    assert_eq!(fired, 1);
    assert!(!timer.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_stopped_timer_never_fires() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);

    let timer = dispatcher.after_func(Duration::from_millis(50), |n: &mut u32| *n += 1);
    timer.stop();
    assert!(!timer.is_active());

    assert!(timeout(Duration::from_secs(1), queue.recv()).await.is_err());
}

#[tokio::test]
async fn test_stop_after_firing_suppresses_callback() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);
    let mut fired = 0;

    let timer = dispatcher.after_func(Duration::ZERO, |n: &mut u32| *n += 1);
    let expired = next_timer(&mut queue).await;
    timer.stop();
    expired.cb(&mut fired);

    assert_eq!(fired, 0);
}

#[tokio::test]
async fn test_panicking_timer_callback_is_contained() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);
    let mut fired = 0;

    dispatcher.after_func(Duration::ZERO, |_: &mut u32| panic!("timer"));
    dispatcher.after_func(Duration::from_millis(5), |n: &mut u32| *n += 1);

    next_timer(&mut queue).await.cb(&mut fired);
    next_timer(&mut queue).await.cb(&mut fired);
    assert_eq!(fired, 1);
}

// ============================================================================
// Cron timers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cron_rearms_until_stopped() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);
    let mut fired = 0;

    let cron = dispatcher.cron_func(CronExpr::parse("* * * * * *").unwrap(), |n: &mut u32| {
        *n += 1
    });
    assert!(!cron.is_inert());

    next_timer(&mut queue).await.cb(&mut fired);
    next_timer(&mut queue).await.cb(&mut fired);
    assert_eq!(fired, 2);

    cron.stop();
    assert!(cron.is_stopped());
    assert!(timeout(Duration::from_secs(5), queue.recv()).await.is_err());
}

#[tokio::test]
async fn test_cron_that_never_matches_is_inert() {
    let (dispatcher, _queue) = Dispatcher::<u32>::new(4);

    let cron = dispatcher.cron_func(CronExpr::parse("0 0 30 2 *").unwrap(), |n: &mut u32| {
        *n += 1
    });
    assert!(cron.is_inert());
    cron.stop();
    cron.stop();
}

#[tokio::test]
async fn test_dropped_cron_releases_its_callback() {
    let (dispatcher, _queue) = Dispatcher::<u32>::new(4);
    let marker = Arc::new(());

    let held = marker.clone();
    let cron = dispatcher.cron_func(CronExpr::parse("0 0 1 1 *").unwrap(), move |n: &mut u32| {
        *n += Arc::strong_count(&held) as u32
    });
    assert_eq!(Arc::strong_count(&marker), 2);
    assert_eq!(dispatcher.sleeping(), 1);

    drop(cron);
    assert_eq!(Arc::strong_count(&marker), 1);

    timeout(Duration::from_secs(1), async {
        while dispatcher.sleeping() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("cron sleeper never aborted");
}

#[tokio::test]
async fn test_closing_queue_aborts_sleeping_timers() {
    let (dispatcher, mut queue) = Dispatcher::<u32>::new(4);
    let marker = Arc::new(());

    let held = marker.clone();
    let timer = dispatcher.after_func(Duration::from_secs(3600), move |n: &mut u32| {
        *n += Arc::strong_count(&held) as u32
    });
    drop(timer);
    assert_eq!(dispatcher.sleeping(), 1);

    queue.close();
    timeout(Duration::from_secs(1), async {
        while Arc::strong_count(&marker) > 1 || dispatcher.sleeping() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("sleeping timer kept its callback after close");

    // Timers created afterwards never arm.
    let late = dispatcher.after_func(Duration::ZERO, |n: &mut u32| *n += 1);
    assert!(!late.is_active());
    assert_eq!(dispatcher.sleeping(), 0);
}

// ============================================================================
// Cron expressions
// ============================================================================

#[test]
fn test_cron_next_every_quarter_hour() {
    let expr = CronExpr::parse("*/15 * * * *").unwrap();
    let after = Utc.with_ymd_and_hms(2024, 5, 10, 10, 7, 30).unwrap();
    assert_eq!(
        expr.next(&after),
        Some(Utc.with_ymd_and_hms(2024, 5, 10, 10, 15, 0).unwrap())
    );
}

#[test]
fn test_cron_next_with_seconds_field() {
    let expr = CronExpr::parse("30 * * * * *").unwrap();
    let after = Utc.with_ymd_and_hms(2024, 5, 10, 10, 0, 45).unwrap();
    assert_eq!(
        expr.next(&after),
        Some(Utc.with_ymd_and_hms(2024, 5, 10, 10, 1, 30).unwrap())
    );

    // Strictly after: a matching instant is skipped.
    let exact = Utc.with_ymd_and_hms(2024, 5, 10, 10, 1, 30).unwrap();
    assert_eq!(
        expr.next(&exact),
        Some(Utc.with_ymd_and_hms(2024, 5, 10, 10, 2, 30).unwrap())
    );
}

#[test]
fn test_cron_next_rolls_over_year() {
    let expr = CronExpr::parse("0 0 1 1 *").unwrap();
    let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    assert_eq!(
        expr.next(&after),
        Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
    );
}

#[test]
fn test_cron_restricted_day_fields_match_either() {
    // 13th of the month or any Friday. 2024-09-01 is a Sunday.
    let expr = CronExpr::parse("0 0 13 * 5").unwrap();
    let after = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
    assert_eq!(
        expr.next(&after),
        Some(Utc.with_ymd_and_hms(2024, 9, 6, 0, 0, 0).unwrap())
    );

    // Only day-of-week restricted.
    let mondays = CronExpr::parse("0 9 * * 1").unwrap();
    assert_eq!(
        mondays.next(&after),
        Some(Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap())
    );
}

#[test]
fn test_cron_lists_and_ranges() {
    let expr = CronExpr::parse("0 8-10/2,22 * * *").unwrap();
    let after = Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap();
    assert_eq!(
        expr.next(&after),
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap())
    );
    let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    assert_eq!(
        expr.next(&later),
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 22, 0, 0).unwrap())
    );
}

#[test]
fn test_cron_impossible_date_has_no_next() {
    let expr: CronExpr = "0 0 30 2 *".parse().unwrap();
    let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(expr.next(&after), None);
}

#[test]
fn test_cron_rejects_malformed_expressions() {
    assert!(matches!(
        CronExpr::parse("* * *"),
        Err(CronError::FieldCount(_))
    ));
    assert!(matches!(
        CronExpr::parse("61 * * * * *"),
        Err(CronError::Field { field: "second", .. })
    ));
    assert!(matches!(
        CronExpr::parse("* 24 * * *"),
        Err(CronError::Field { field: "hour", .. })
    ));
    assert!(matches!(
        CronExpr::parse("*/0 * * * *"),
        Err(CronError::Field { .. })
    ));
    assert!(matches!(
        CronExpr::parse("x * * * *"),
        Err(CronError::Field { field: "minute", .. })
    ));
    assert_eq!(CronExpr::parse(" 0 0 * * * ").unwrap().to_string(), "0 0 * * *");
}
