use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use unionhub_db::Database;
use unionhub_types::content::ContentType;

use crate::email::BroadcastMailer;

/// Content kinds the reminder scheduler watches.
const WATCHED: [ContentType; 2] = [ContentType::Meetings, ContentType::Votes];

/// Background task that sends at-most-one reminder email per upcoming item.
///
/// Runs once immediately, then on a fixed interval. A failing cycle is logged
/// and the next tick proceeds as normal.
pub async fn run_reminder_loop<M: BroadcastMailer>(
    db: Arc<Database>,
    mailer: Arc<M>,
    interval_secs: u64,
) {
    info!("Starting reminder scheduler (every {}s)", interval_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        if let Err(e) = check_reminders(&db, mailer.as_ref(), Utc::now()).await {
            error!("Reminder cycle error: {}", e);
        }
    }
}

/// One scheduler cycle at instant `now`.
///
/// Missing or disabled settings, a blank lead time, and an unparsable lead
/// time all skip the cycle silently.
pub async fn check_reminders<M: BroadcastMailer>(
    db: &Database,
    mailer: &M,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let Some(settings) = db.reminder_settings()? else {
        return Ok(());
    };
    if !settings.enabled || settings.selected_time.trim().is_empty() {
        return Ok(());
    }

    let lead_minutes = parse_lead_minutes(&settings.selected_time);
    if lead_minutes <= 0.0 {
        return Ok(());
    }

    for kind in WATCHED {
        // One kind failing must not starve the other.
        if let Err(e) = process_kind(db, mailer, kind, lead_minutes, now).await {
            warn!("Reminder pass failed for {}: {}", kind.as_str(), e);
        }
    }
    Ok(())
}

async fn process_kind<M: BroadcastMailer>(
    db: &Database,
    mailer: &M,
    kind: ContentType,
    lead_minutes: f64,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let emails = db.all_user_emails()?;
    if emails.is_empty() {
        return Ok(());
    }

    // A lead beyond chrono's range can never bound a real window; skip rather
    // than let Duration construction panic.
    let Some(lead) = chrono::Duration::try_seconds((lead_minutes * 60.0) as i64) else {
        return Ok(());
    };

    for item in db.pending_reminders(kind)? {
        // Unparsable target: leave pending, retry next cycle.
        let Some(target) = target_time(kind, &item.data) else {
            continue;
        };
        let trigger = target - lead;

        if now > target {
            // Event already happened; mark so we stop re-examining it, but
            // never send a late reminder.
            db.mark_reminder_sent(kind, item.id)?;
            continue;
        }

        if now >= trigger {
            let title = item_title(&item.data);
            let subject = format!("Reminder: Upcoming {} - {}", kind.label(), title);
            let html = format!(
                "<div style=\"font-family: Arial, sans-serif;\">\
                 <p>Hello,</p>\
                 <p>This is a reminder for the upcoming <strong>{}</strong>.</p>\
                 <h3 style=\"color: #007bff;\">{}</h3>\
                 <p>It is scheduled for: <strong>{}</strong></p>\
                 <p>Please log in to Union Hub for more details.</p>\
                 <br/>\
                 <p>Union Hub Team</p>\
                 </div>",
                kind.label(),
                title,
                target.format("%Y-%m-%d %H:%M UTC"),
            );

            // At-most-once: the item is marked reminded whether or not the
            // send succeeded. A failed send is logged, never retried.
            match mailer.send_broadcast(&emails, &subject, &html).await {
                Ok(()) => info!(
                    "Sent reminder for {} {} to {} users",
                    kind.as_str(),
                    item.id,
                    emails.len()
                ),
                Err(e) => error!(
                    "Failed to send reminder for {} {}: {}",
                    kind.as_str(),
                    item.id,
                    e
                ),
            }
            db.mark_reminder_sent(kind, item.id)?;
        }
    }

    Ok(())
}

/// Lead time grammar: numeric prefix plus a unit token. "hour" anywhere in the
/// string means hours, "min" means minutes, anything else parses to 0 and the
/// caller skips the cycle.
fn parse_lead_minutes(raw: &str) -> f64 {
    let lower = raw.to_lowercase();
    if lower.contains("hour") {
        return leading_float(&lower) * 60.0;
    }
    if lower.contains("min") {
        return leading_float(&lower);
    }
    0.0
}

/// Numeric prefix of the string, 0 when there is none.
fn leading_float(raw: &str) -> f64 {
    let trimmed = raw.trim_start();
    let end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    trimmed[..end].parse().unwrap_or(0.0)
}

/// The instant the item's underlying event occurs. Meetings combine `date` and
/// `startTime`; votes carry `endDate` directly. All instants are UTC.
fn target_time(kind: ContentType, data: &Map<String, Value>) -> Option<DateTime<Utc>> {
    match kind {
        ContentType::Meetings => {
            let date = data.get("date")?.as_str()?;
            let start = data.get("startTime")?.as_str()?;
            if date.is_empty() || start.is_empty() {
                return None;
            }
            parse_instant(&format!("{date}T{start}"))
        }
        ContentType::Votes => parse_instant(data.get("endDate")?.as_str()?),
        _ => None,
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn item_title(data: &Map<String, Value>) -> &str {
    for key in ["title", "name", "pollName"] {
        if let Some(value) = data.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    "Event"
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every broadcast instead of transmitting.
    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(Vec<String>, String)>>,
        fail: bool,
    }

    impl RecordingMailer {
        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl BroadcastMailer for RecordingMailer {
        async fn send_broadcast(&self, bcc: &[String], subject: &str, _html: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((bcc.to_vec(), subject.to_string()));
            if self.fail {
                anyhow::bail!("relay down");
            }
            Ok(())
        }
    }

    fn payload(value: serde_json::Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn db_with_settings(selected_time: &str, enabled: bool) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("a@x.com", "hash", "employee", None, None)
            .unwrap();
        db.create_content(
            ContentType::Notifications,
            payload(json!({
                "kind": "reminder_settings",
                "enabled": enabled,
                "selectedTime": selected_time,
            })),
            None,
        )
        .unwrap();
        db
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn lead_time_grammar() {
        assert_eq!(parse_lead_minutes("30 mins"), 30.0);
        assert_eq!(parse_lead_minutes("5 mins"), 5.0);
        assert_eq!(parse_lead_minutes("2 hours"), 120.0);
        assert_eq!(parse_lead_minutes("1 hour"), 60.0);
        assert_eq!(parse_lead_minutes("24 hours"), 1440.0);
        assert_eq!(parse_lead_minutes("garbage"), 0.0);
        assert_eq!(parse_lead_minutes("soon"), 0.0);
        assert_eq!(parse_lead_minutes("minutes"), 0.0);
        assert_eq!(parse_lead_minutes(""), 0.0);
    }

    #[test]
    fn meeting_target_combines_date_and_start_time() {
        let data = payload(json!({"date": "2025-01-01", "startTime": "09:00"}));
        assert_eq!(
            target_time(ContentType::Meetings, &data),
            Some(at(2025, 1, 1, 9, 0, 0))
        );

        let missing = payload(json!({"date": "2025-01-01"}));
        assert_eq!(target_time(ContentType::Meetings, &missing), None);

        let bad = payload(json!({"date": "someday", "startTime": "late"}));
        assert_eq!(target_time(ContentType::Meetings, &bad), None);
    }

    #[test]
    fn vote_target_accepts_several_date_shapes() {
        let iso = payload(json!({"endDate": "2025-06-01T12:00:00Z"}));
        assert_eq!(
            target_time(ContentType::Votes, &iso),
            Some(at(2025, 6, 1, 12, 0, 0))
        );

        let bare = payload(json!({"endDate": "2025-06-01"}));
        assert_eq!(
            target_time(ContentType::Votes, &bare),
            Some(at(2025, 6, 1, 0, 0, 0))
        );

        let unset = payload(json!({"name": "poll"}));
        assert_eq!(target_time(ContentType::Votes, &unset), None);
    }

    #[tokio::test]
    async fn meeting_reminder_sends_once_inside_window() {
        let db = db_with_settings("10 mins", true);
        let mailer = RecordingMailer::default();
        let meeting = db
            .create_content(
                ContentType::Meetings,
                payload(json!({"title": "AGM", "date": "2025-01-01", "startTime": "09:00"})),
                None,
            )
            .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 52, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 1);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].0, vec!["a@x.com".to_string()]);
        assert!(sent[0].1.contains("Meeting"));
        assert!(sent[0].1.contains("AGM"));
        drop(sent);

        let item = db
            .get_content(ContentType::Meetings, meeting.id)
            .unwrap()
            .unwrap();
        assert_eq!(item.data.get("reminderSent"), Some(&json!(true)));

        // Second run a minute later: nothing new goes out.
        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 53, 0))
            .await
            .unwrap();
        assert_eq!(mailer.count(), 1);
    }

    #[tokio::test]
    async fn rerun_without_clock_advance_sends_nothing() {
        let db = db_with_settings("30 mins", true);
        let mailer = RecordingMailer::default();
        db.create_content(
            ContentType::Votes,
            payload(json!({"name": "Ballot", "endDate": "2025-01-01T10:00:00Z"})),
            None,
        )
        .unwrap();

        let now = at(2025, 1, 1, 9, 45, 0);
        check_reminders(&db, &mailer, now).await.unwrap();
        check_reminders(&db, &mailer, now).await.unwrap();
        assert_eq!(mailer.count(), 1);
    }

    #[tokio::test]
    async fn exact_target_time_still_sends() {
        let db = db_with_settings("10 mins", true);
        let mailer = RecordingMailer::default();
        let meeting = db
            .create_content(
                ContentType::Meetings,
                payload(json!({"title": "Now", "date": "2025-01-01", "startTime": "09:00"})),
                None,
            )
            .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 9, 0, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 1);
        let item = db
            .get_content(ContentType::Meetings, meeting.id)
            .unwrap()
            .unwrap();
        assert_eq!(item.data.get("reminderSent"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn passed_event_is_marked_without_sending() {
        let db = db_with_settings("10 mins", true);
        let mailer = RecordingMailer::default();
        let meeting = db
            .create_content(
                ContentType::Meetings,
                payload(json!({"title": "Missed", "date": "2025-01-01", "startTime": "09:00"})),
                None,
            )
            .unwrap();

        // One second past the event
        check_reminders(&db, &mailer, at(2025, 1, 1, 9, 0, 1))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 0);
        let item = db
            .get_content(ContentType::Meetings, meeting.id)
            .unwrap()
            .unwrap();
        assert_eq!(item.data.get("reminderSent"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn before_trigger_time_leaves_item_pending() {
        let db = db_with_settings("10 mins", true);
        let mailer = RecordingMailer::default();
        db.create_content(
            ContentType::Meetings,
            payload(json!({"title": "Later", "date": "2025-01-01", "startTime": "09:00"})),
            None,
        )
        .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 0, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 0);
        assert_eq!(db.pending_reminders(ContentType::Meetings).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vote_without_end_date_stays_pending_forever() {
        let db = db_with_settings("30 mins", true);
        let mailer = RecordingMailer::default();
        db.create_content(ContentType::Votes, payload(json!({"name": "No date"})), None)
            .unwrap();

        for minute in 0..5 {
            check_reminders(&db, &mailer, at(2025, 1, 1, 9, minute, 0))
                .await
                .unwrap();
        }

        assert_eq!(mailer.count(), 0);
        assert_eq!(db.pending_reminders(ContentType::Votes).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_or_unparsable_settings_skip_cycle() {
        for (time, enabled) in [("30 mins", false), ("garbage", true), ("  ", true)] {
            let db = db_with_settings(time, enabled);
            let mailer = RecordingMailer::default();
            db.create_content(
                ContentType::Meetings,
                payload(json!({"title": "M", "date": "2025-01-01", "startTime": "09:00"})),
                None,
            )
            .unwrap();

            check_reminders(&db, &mailer, at(2025, 1, 1, 8, 55, 0))
                .await
                .unwrap();

            assert_eq!(mailer.count(), 0);
            assert_eq!(db.pending_reminders(ContentType::Meetings).unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn oversized_lead_time_skips_without_panicking() {
        let db = db_with_settings("99999999999999999999 mins", true);
        let mailer = RecordingMailer::default();
        db.create_content(
            ContentType::Meetings,
            payload(json!({"title": "M", "date": "2025-01-01", "startTime": "09:00"})),
            None,
        )
        .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 55, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 0);
        assert_eq!(db.pending_reminders(ContentType::Meetings).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_settings_record_is_a_silent_noop() {
        let db = Database::open_in_memory().unwrap();
        let mailer = RecordingMailer::default();
        check_reminders(&db, &mailer, Utc::now()).await.unwrap();
        assert_eq!(mailer.count(), 0);
    }

    #[tokio::test]
    async fn no_recipients_skips_the_kind() {
        let db = Database::open_in_memory().unwrap();
        let mailer = RecordingMailer::default();
        db.create_content(
            ContentType::Notifications,
            payload(json!({"kind": "reminder_settings", "enabled": true, "selectedTime": "10 mins"})),
            None,
        )
        .unwrap();
        db.create_content(
            ContentType::Meetings,
            payload(json!({"title": "M", "date": "2025-01-01", "startTime": "09:00"})),
            None,
        )
        .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 55, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 0);
        // Item is untouched, not marked
        assert_eq!(db.pending_reminders(ContentType::Meetings).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_still_marks_reminded() {
        let db = db_with_settings("10 mins", true);
        let mailer = RecordingMailer::failing();
        let meeting = db
            .create_content(
                ContentType::Meetings,
                payload(json!({"title": "Flaky", "date": "2025-01-01", "startTime": "09:00"})),
                None,
            )
            .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 55, 0))
            .await
            .unwrap();

        let item = db
            .get_content(ContentType::Meetings, meeting.id)
            .unwrap()
            .unwrap();
        assert_eq!(item.data.get("reminderSent"), Some(&json!(true)));

        // No retry on the next cycle
        check_reminders(&db, &mailer, at(2025, 1, 1, 8, 56, 0))
            .await
            .unwrap();
        assert_eq!(mailer.count(), 1);
    }

    #[tokio::test]
    async fn watches_meetings_and_votes_in_one_cycle() {
        let db = db_with_settings("1 hour", true);
        let mailer = RecordingMailer::default();
        db.create_content(
            ContentType::Meetings,
            payload(json!({"title": "AGM", "date": "2025-01-01", "startTime": "09:30"})),
            None,
        )
        .unwrap();
        db.create_content(
            ContentType::Votes,
            payload(json!({"name": "Ballot", "endDate": "2025-01-01T09:45:00Z"})),
            None,
        )
        .unwrap();

        check_reminders(&db, &mailer, at(2025, 1, 1, 9, 0, 0))
            .await
            .unwrap();

        assert_eq!(mailer.count(), 2);
        let sent = mailer.sent.lock().unwrap();
        assert!(sent[0].1.contains("Meeting"));
        assert!(sent[1].1.contains("Vote"));
    }
}
