//! Cron grammar.
//!
//! Accepts standard 5-field expressions (`min hour dom month dow`), 6-field
//! expressions with a leading seconds field, and the `@yearly`, `@monthly`,
//! `@weekly`, `@daily` and `@hourly` descriptors. Evaluation is in UTC.
//! Day-of-week numbers are the standard 0-6 with Sunday = 0 (7 is also
//! Sunday). They are rewritten to day names before the `cron` crate sees
//! them, since it counts 1-7 from Sunday.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::ValidationError;

const DESCRIPTORS: [&str; 5] = ["@yearly", "@monthly", "@weekly", "@daily", "@hourly"];

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed, validated cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let normalized = if trimmed.starts_with('@') {
            if !DESCRIPTORS.contains(&trimmed) {
                return Err(invalid(format!("unsupported descriptor {trimmed}")));
            }
            trimmed.to_string()
        } else {
            let mut fields = trimmed
                .split_whitespace()
                .map(String::from)
                .collect::<Vec<_>>();
            match fields.len() {
                5 => fields.insert(0, "0".into()),
                6 => {}
                n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
            }
            if let Some(dow) = fields.last_mut() {
                *dow = day_names(dow).map_err(invalid)?;
            }
            fields.join(" ")
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { schedule })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Rewrite numeric day-of-week items (`0`, `1-5`, `*/2`, `1,3`) as day
/// names. Named items, `*` and `?` pass through unchanged.
fn day_names(field: &str) -> Result<String, String> {
    let mut days: Vec<String> = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in {item:?}"))?;
                (base, Some(step))
            }
            None => (item, None),
        };

        let range = if base == "*" {
            step.map(|_| (0, 6))
        } else if let Some((start, end)) = base.split_once('-') {
            match (start.parse::<usize>(), end.parse::<usize>()) {
                (Ok(start), Ok(end)) => Some((start, end)),
                _ => None,
            }
        } else {
            base.parse::<usize>()
                .ok()
                .map(|start| (start, if step.is_some() { 6 } else { start }))
        };

        let Some((start, end)) = range else {
            days.push(item.to_string());
            continue;
        };
        if end > 7 || start > end {
            return Err(format!("day-of-week {item:?} is outside 0-7"));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[day % 7].to_string();
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }
    Ok(days.join(","))
}

/// Validate a cron expression without keeping the parsed schedule.
pub fn validate_cron(expression: &str) -> Result<(), ValidationError> {
    CronSchedule::parse(expression).map(|_| ())
}
