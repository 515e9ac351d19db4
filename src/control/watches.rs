use crate::event::{BusEvent, EventBus};
use crate::model::OptionsMap;
use chrono::{DateTime, Datelike, Local, NaiveTime, TimeZone};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn option_u64(options: &OptionsMap, key: &str) -> Option<u64> {
    match options.get(key)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Interval and time-of-day watches, driven off the shared 1s bus tick
/// instead of per-watch OS timers.
#[derive(Debug, Default)]
pub struct TimerWatches {
    enabled: bool,
    intervals: HashMap<String, IntervalWatch>,
    timeofday: HashMap<String, TimeOfDayWatch>,
}

#[derive(Debug)]
struct IntervalWatch {
    period: u64,
    next_due: u64,
}

#[derive(Debug)]
struct TimeOfDayWatch {
    time: NaiveTime,
    days: Vec<u32>,
    next_unix_ms: Option<i64>,
}

impl TimerWatches {
    pub fn set_enabled(&mut self, enabled: bool, now_seconds: u64) {
        self.enabled = enabled;
        if enabled {
            // Re-arm from now, so a long-disabled trigger doesn't fire a
            // backlog on enable.
            for watch in self.intervals.values_mut() {
                watch.next_due = now_seconds + watch.period;
            }
            let now = Local::now();
            for watch in self.timeofday.values_mut() {
                watch.next_unix_ms = next_time_of_day(now, watch.time, &watch.days);
            }
        }
    }

    pub fn set_interval(&mut self, id: &str, options: &OptionsMap, now_seconds: u64) {
        match option_u64(options, "seconds").filter(|s| *s > 0) {
            Some(period) => {
                self.intervals.insert(
                    id.to_string(),
                    IntervalWatch {
                        period,
                        next_due: now_seconds + period,
                    },
                );
            }
            None => {
                warn!("interval watch {id}: invalid seconds option");
                self.intervals.remove(id);
            }
        }
    }

    pub fn clear_interval(&mut self, id: &str) {
        self.intervals.remove(id);
    }

    pub fn set_time_of_day(&mut self, id: &str, options: &OptionsMap) {
        match parse_time_of_day(options) {
            Some((time, days)) => {
                let next_unix_ms = next_time_of_day(Local::now(), time, &days);
                self.timeofday.insert(
                    id.to_string(),
                    TimeOfDayWatch {
                        time,
                        days,
                        next_unix_ms,
                    },
                );
            }
            None => {
                warn!("timeofday watch {id}: invalid time/days options");
                self.timeofday.remove(id);
            }
        }
    }

    pub fn clear_time_of_day(&mut self, id: &str) {
        self.timeofday.remove(id);
    }

    /// Advance all watches by one tick, returning how many came due.
    pub fn on_tick(&mut self, now_seconds: u64, unix_ms: i64) -> u32 {
        if !self.enabled {
            return 0;
        }

        let mut fires = 0;
        for watch in self.intervals.values_mut() {
            if now_seconds >= watch.next_due {
                watch.next_due = now_seconds + watch.period;
                fires += 1;
            }
        }
        for watch in self.timeofday.values_mut() {
            if let Some(due) = watch.next_unix_ms {
                if unix_ms >= due {
                    watch.next_unix_ms = next_time_of_day(Local::now(), watch.time, &watch.days);
                    fires += 1;
                }
            }
        }
        fires
    }

    pub fn interval_description(options: &OptionsMap) -> String {
        match option_u64(options, "seconds") {
            Some(s) if s >= 3600 && s % 3600 == 0 => format!("Every {} hours", s / 3600),
            Some(s) if s >= 60 && s % 60 == 0 => format!("Every {} minutes", s / 60),
            Some(s) => format!("Every {s} seconds"),
            None => "Every ? seconds".to_string(),
        }
    }

    pub fn time_of_day_description(options: &OptionsMap) -> String {
        match parse_time_of_day(options) {
            Some((time, days)) => {
                const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
                let days: Vec<&str> = days
                    .iter()
                    .filter_map(|d| NAMES.get(*d as usize).copied())
                    .collect();
                if days.len() == 7 {
                    format!("Daily at {time}")
                } else {
                    format!("At {time} on {}", days.join(", "))
                }
            }
            None => "At an invalid time".to_string(),
        }
    }
}

fn parse_time_of_day(options: &OptionsMap) -> Option<(NaiveTime, Vec<u32>)> {
    let time = options.get("time")?.as_str()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .ok()?;
    let days: Vec<u32> = options
        .get("days")?
        .as_array()?
        .iter()
        .filter_map(|d| d.as_u64().map(|d| d as u32))
        .filter(|d| *d < 7)
        .collect();
    if days.is_empty() {
        return None;
    }
    Some((time, days))
}

/// Next wall-clock occurrence of `time` on one of the selected weekdays
/// (0 = Sunday), strictly after `now`. A day where the time falls into a
/// DST gap is skipped, not treated as the end of the search.
fn next_time_of_day<Tz: TimeZone>(now: DateTime<Tz>, time: NaiveTime, days: &[u32]) -> Option<i64> {
    for offset in 0..=7u64 {
        let date = now.date_naive() + chrono::Days::new(offset);
        if !days.contains(&date.weekday().num_days_from_sunday()) {
            continue;
        }
        let Some(candidate) = now
            .timezone()
            .from_local_datetime(&date.and_time(time))
            .earliest()
        else {
            continue;
        };
        if candidate > now {
            return Some(candidate.timestamp_millis());
        }
    }
    None
}

/// Startup, client-connect and press watches. Delayed fires are spawned
/// tasks that report back over the bus; cancelling the owner token kills
/// every pending fire.
pub struct MiscWatches {
    enabled: bool,
    control_id: String,
    bus: EventBus,
    cancel: CancellationToken,
    startup: HashMap<String, u64>,
    client_connect: HashMap<String, u64>,
    press: HashMap<String, bool>,
    pending: HashMap<String, CancellationToken>,
}

impl MiscWatches {
    pub fn new(control_id: String, bus: EventBus, cancel: CancellationToken) -> Self {
        Self {
            enabled: false,
            control_id,
            bus,
            cancel,
            startup: HashMap::new(),
            client_connect: HashMap::new(),
            press: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        let was_enabled = self.enabled;
        self.enabled = enabled;
        if !enabled {
            for (_, token) in self.pending.drain() {
                token.cancel();
            }
        } else if !was_enabled {
            // Startup watches fire a fresh delay after being armed.
            let startups: Vec<(String, u64)> =
                self.startup.iter().map(|(id, d)| (id.clone(), *d)).collect();
            for (id, delay) in startups {
                self.spawn_delayed(&id, delay);
            }
        }
    }

    pub fn set_startup(&mut self, id: &str, options: &OptionsMap) {
        let delay = option_u64(options, "delay").unwrap_or(0);
        self.startup.insert(id.to_string(), delay);
        if self.enabled {
            self.spawn_delayed(id, delay);
        }
    }

    pub fn clear_startup(&mut self, id: &str) {
        self.startup.remove(id);
        self.cancel_pending(id);
    }

    pub fn set_client_connect(&mut self, id: &str, options: &OptionsMap) {
        let delay = option_u64(options, "delay").unwrap_or(0);
        self.client_connect.insert(id.to_string(), delay);
    }

    pub fn clear_client_connect(&mut self, id: &str) {
        self.client_connect.remove(id);
        self.cancel_pending(id);
    }

    pub fn set_press(&mut self, id: &str, on_press: bool) {
        self.press.insert(id.to_string(), on_press);
    }

    pub fn clear_press(&mut self, id: &str) {
        self.press.remove(id);
    }

    /// Does any armed press watch match this press/depress?
    pub fn wants_press(&self, pressed: bool) -> bool {
        self.enabled && self.press.values().any(|on_press| *on_press == pressed)
    }

    /// A client connected: start the delay of every armed connect watch.
    pub fn on_client_connect(&mut self) {
        if !self.enabled {
            return;
        }
        let watches: Vec<(String, u64)> = self
            .client_connect
            .iter()
            .map(|(id, d)| (id.clone(), *d))
            .collect();
        for (id, delay) in watches {
            self.spawn_delayed(&id, delay);
        }
    }

    /// Validate a delayed completion: only fire if the watch is still armed.
    pub fn take_pending(&mut self, event_id: &str) -> bool {
        self.pending.remove(event_id).is_some() && self.enabled
    }

    fn cancel_pending(&mut self, id: &str) {
        if let Some(token) = self.pending.remove(id) {
            token.cancel();
        }
    }

    fn spawn_delayed(&mut self, event_id: &str, delay_ms: u64) {
        self.cancel_pending(event_id);

        let token = self.cancel.child_token();
        self.pending.insert(event_id.to_string(), token.clone());

        let bus = self.bus.clone();
        let control_id = self.control_id.clone();
        let event_id = event_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    bus.emit(BusEvent::TriggerEventFired { control_id, event_id });
                }
            }
        });
    }
}

/// Variable-change watches: event id -> watched variable name.
#[derive(Debug, Default)]
pub struct VariableWatches {
    enabled: bool,
    watched: HashMap<String, String>,
}

impl VariableWatches {
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_variable(&mut self, id: &str, options: &OptionsMap) {
        match options.get("variable_id").and_then(|v| v.as_str()) {
            Some(name) => {
                self.watched.insert(id.to_string(), name.to_string());
            }
            None => {
                warn!("variable watch {id}: missing variable_id option");
                self.watched.remove(id);
            }
        }
    }

    pub fn clear_variable(&mut self, id: &str) {
        self.watched.remove(id);
    }

    /// Does any armed watch match one of the changed variables?
    pub fn matches(&self, changed: &HashSet<String>) -> bool {
        self.enabled && self.watched.values().any(|name| changed.contains(name))
    }

    pub fn description(options: &OptionsMap) -> String {
        match options.get("variable_id").and_then(|v| v.as_str()) {
            Some(name) => format!("When $({name}) changes"),
            None => "When a variable changes".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: serde_json::Value) -> OptionsMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn interval_fires_only_while_enabled() {
        let mut watches = TimerWatches::default();
        watches.set_interval("e1", &options(json!({ "seconds": 5 })), 0);

        // Disabled: nothing fires, ever.
        assert_eq!(watches.on_tick(10, 0), 0);

        watches.set_enabled(true, 10);
        assert_eq!(watches.on_tick(11, 0), 0);
        assert_eq!(watches.on_tick(15, 0), 1);
        assert_eq!(watches.on_tick(16, 0), 0);
        assert_eq!(watches.on_tick(20, 0), 1);
    }

    #[test]
    fn invalid_interval_options_disarm_the_watch() {
        let mut watches = TimerWatches::default();
        watches.set_enabled(true, 0);
        watches.set_interval("e1", &options(json!({ "seconds": "nope" })), 0);
        assert_eq!(watches.on_tick(1000, 0), 0);
    }

    #[test]
    fn interval_descriptions() {
        assert_eq!(
            TimerWatches::interval_description(&options(json!({ "seconds": 30 }))),
            "Every 30 seconds"
        );
        assert_eq!(
            TimerWatches::interval_description(&options(json!({ "seconds": 120 }))),
            "Every 2 minutes"
        );
        assert_eq!(
            TimerWatches::interval_description(&options(json!({ "seconds": 7200 }))),
            "Every 2 hours"
        );
    }

    #[test]
    fn time_of_day_parses_and_describes() {
        let opts = options(json!({ "time": "07:30:00", "days": [1, 2, 3, 4, 5] }));
        let (time, days) = parse_time_of_day(&opts).unwrap();
        assert_eq!(time, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert_eq!(days, vec![1, 2, 3, 4, 5]);

        assert_eq!(
            TimerWatches::time_of_day_description(&opts),
            "At 07:30:00 on Mon, Tue, Wed, Thu, Fri"
        );
        assert_eq!(
            TimerWatches::time_of_day_description(&options(
                json!({ "time": "07:30:00", "days": [0, 1, 2, 3, 4, 5, 6] })
            )),
            "Daily at 07:30:00"
        );
    }

    #[test]
    fn next_time_of_day_skips_to_selected_weekday() {
        // 2026-08-26 is a Wednesday.
        let now = Local.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap();
        let time = NaiveTime::from_hms_opt(9, 0, 0).unwrap();

        // 9:00 already passed today; next Wednesday is seven days out.
        let next = next_time_of_day(now, time, &[3]).unwrap();
        let next = Local.timestamp_millis_opt(next).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2026, 9, 2, 9, 0, 0).unwrap());

        // Sunday (0) is four days out.
        let next = next_time_of_day(now, time, &[0]).unwrap();
        let next = Local.timestamp_millis_opt(next).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2026, 8, 30, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_time_of_day_skips_dst_gap_days() {
        use chrono_tz::America::New_York;

        // 02:30 does not exist on 2026-03-08 in New York (DST starts at
        // 02:00). The search must carry on to the following Sunday.
        let now = New_York.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let time = NaiveTime::from_hms_opt(2, 30, 0).unwrap();

        let next = next_time_of_day(now, time, &[0]).unwrap();
        let next = New_York.timestamp_millis_opt(next).unwrap();
        assert_eq!(next, New_York.with_ymd_and_hms(2026, 3, 15, 2, 30, 0).unwrap());
    }

    #[test]
    fn variable_watch_matches_by_name() {
        let mut watches = VariableWatches::default();
        watches.set_variable("e1", &options(json!({ "variable_id": "internal:time" })));
        watches.set_enabled(true);

        let changed: HashSet<String> = ["internal:time".to_string()].into();
        assert!(watches.matches(&changed));

        let other: HashSet<String> = ["internal:date".to_string()].into();
        assert!(!watches.matches(&other));

        watches.set_enabled(false);
        assert!(!watches.matches(&changed));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_watch_fires_after_delay_once_enabled() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let mut watches = MiscWatches::new("trigger:t1".to_string(), bus, cancel);

        watches.set_startup("e1", &options(json!({ "delay": 500 })));

        // Not enabled yet: no pending fire.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());

        watches.set_enabled(true);
        // Let the spawned delay task register its sleep before advancing.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        tokio::task::yield_now().await;
        match rx.try_recv() {
            Ok(BusEvent::TriggerEventFired { control_id, event_id }) => {
                assert_eq!(control_id, "trigger:t1");
                assert_eq!(event_id, "e1");
            }
            other => panic!("expected fire, got {other:?}"),
        }
        assert!(watches.take_pending("e1"));
        assert!(!watches.take_pending("e1"), "one-shot");
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_cancels_pending_delays() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let mut watches = MiscWatches::new("trigger:t1".to_string(), bus, cancel);

        watches.set_enabled(true);
        watches.set_startup("e1", &options(json!({ "delay": 500 })));
        watches.set_enabled(false);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err(), "disabled watch must never fire");
    }
}
