//! Calendar connector: cron schedules or fixed intervals.

use super::dispatch_outcome;
use crate::connector::Connector;
use crate::eventsource::EventSourceType;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use eventgate::event::Dispatcher;
use eventgate::filter::FilterConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound on occurrences skipped while looking past exclusion dates.
const MAX_EXCLUDED_SKIPS: usize = 1_000_000;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CalendarEventSource {
    /// Five-field cron expression, e.g. "30 9 * * *". Wins over `interval`.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Fixed period, e.g. "10s", "1h30m" or "250ms"
    #[serde(default)]
    pub interval: Option<String>,
    /// IANA zone the schedule and exclusion dates are read in (UTC if unset)
    #[serde(default)]
    pub timezone: Option<String>,
    /// Days without events, as "YYYY-MM-DD" or RFC 3339 timestamps
    #[serde(default)]
    pub exclusion_dates: Vec<String>,
    #[serde(default)]
    pub user_payload: Option<Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

impl CalendarEventSource {
    /// Resolves schedule, zone and exclusion dates.
    fn plan(&self) -> Result<Plan> {
        let cadence = match (&self.schedule, &self.interval) {
            (Some(schedule), _) if !schedule.trim().is_empty() => Cadence::Cron(Box::new(
                parse_cron(schedule)
                    .with_context(|| format!("failed to parse schedule '{}'", schedule))?,
            )),
            (_, Some(interval)) if !interval.trim().is_empty() => {
                let period = parse_interval(interval)
                    .with_context(|| format!("failed to parse interval '{}'", interval))?;
                if period.is_zero() {
                    bail!("interval must be greater than zero");
                }
                let period = chrono::Duration::from_std(period)
                    .map_err(|_| anyhow!("interval '{}' is too large", interval))?;
                Cadence::Every(period)
            }
            _ => bail!("calendar event must contain either a schedule or an interval"),
        };

        let timezone = match self.timezone.as_deref().map(str::trim) {
            None | Some("") => Tz::UTC,
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| anyhow!("failed to load timezone '{}'", name))?,
        };

        let exclusions = self
            .exclusion_dates
            .iter()
            .map(|date| parse_exclusion_date(date, timezone))
            .collect::<Result<Vec<_>>>()?;

        Ok(Plan {
            cadence,
            timezone,
            exclusions,
        })
    }
}

#[derive(Debug)]
enum Cadence {
    Every(chrono::Duration),
    Cron(Box<cron::Schedule>),
}

/// Resolved schedule of one calendar entry.
#[derive(Debug)]
struct Plan {
    cadence: Cadence,
    timezone: Tz,
    exclusions: Vec<NaiveDate>,
}

impl Plan {
    /// First occurrence strictly after `last` that is not on an excluded day.
    fn next_after(&self, last: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut candidate = *last;
        for _ in 0..MAX_EXCLUDED_SKIPS {
            candidate = match &self.cadence {
                Cadence::Every(period) => candidate.checked_add_signed(*period)?,
                Cadence::Cron(schedule) => schedule.after(&candidate).next()?,
            };
            if !self.exclusions.contains(&candidate.date_naive()) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Parses a standard five-field cron expression. Six and seven field forms
/// (with seconds, and year) are passed through.
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let expression = expression.trim();
    let full = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&full).map_err(|e| anyhow!("{}", e))
}

fn parse_exclusion_date(value: &str, timezone: Tz) -> Result<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&timezone).date_naive())
        .map_err(|_| anyhow!("failed to parse exclusion date '{}'", value))
}

/// Parses a duration written as a sequence of `<number><unit>` pairs with
/// units `ms`, `s`, `m` and `h`.
fn parse_interval(value: &str) -> Result<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        bail!("empty interval");
    }
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("missing unit"))?;
        if digits == 0 {
            bail!("expected a number");
        }
        let amount: u64 = rest[..digits].parse()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            other => bail!("unknown unit '{}'", other),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(|| anyhow!("interval is too large"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEventData<'a> {
    event_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_payload: Option<&'a Value>,
    metadata: &'a BTreeMap<String, String>,
}

pub struct CalendarConnector {
    event_source_name: String,
    event_name: String,
    spec: CalendarEventSource,
}

impl CalendarConnector {
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        spec: CalendarEventSource,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            spec,
        }
    }

    fn payload(&self, at: &DateTime<Tz>) -> Result<Vec<u8>> {
        let data = CalendarEventData {
            event_time: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            user_payload: self.spec.user_payload.as_ref(),
            metadata: &self.spec.metadata,
        };
        serde_json::to_vec(&data).context("failed to marshal the calendar event")
    }
}

#[async_trait]
impl Connector for CalendarConnector {
    fn event_name(&self) -> &str {
        &self.event_name
    }

    fn event_source_name(&self) -> &str {
        &self.event_source_name
    }

    fn event_source_type(&self) -> EventSourceType {
        EventSourceType::Calendar
    }

    async fn validate(&self) -> Result<()> {
        self.spec.plan().map(|_| ())
    }

    async fn listen(&self, ctx: CancellationToken, dispatch: Arc<dyn Dispatcher>) -> Result<()> {
        let plan = self.spec.plan()?;
        info!(
            event_source = %self.event_source_name,
            event_name = %self.event_name,
            timezone = %plan.timezone,
            exclusions = plan.exclusions.len(),
            "Started processing the calendar event source"
        );

        let mut last = Utc::now().with_timezone(&plan.timezone);
        loop {
            let next = plan
                .next_after(&last)
                .ok_or_else(|| anyhow!("calendar schedule has no upcoming time"))?;
            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(
                event_name = %self.event_name,
                next = %next.to_rfc3339(),
                "Expected next calendar event"
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    info!(event_name = %self.event_name, "Exiting calendar event listener");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let payload = self.payload(&next)?;
            debug!(event_name = %self.event_name, "Dispatching calendar event");
            dispatch_outcome(
                dispatch.dispatch(payload, &[]).await,
                &self.event_source_name,
                &self.event_name,
            )?;
            last = next;
        }
    }
}
