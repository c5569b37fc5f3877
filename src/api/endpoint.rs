//! Endpoint names and dispatch to JSON.
//!
//! Both the HTTP server and `mailpulse api <name>` go through [`dispatch`],
//! so they answer identically. A failing or panicking operation becomes a
//! 500 `exception` body; the caller never sees the panic.

#![allow(missing_docs)]

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};

use crate::api::monitor::Monitor;
use crate::core::errors::{MpError, Result};
use crate::logger::activity::ActivityLoggerHandle;
use crate::logger::jsonl::{ActivityEntry, EventType, Severity};
use crate::stats::talkers::TalkerSpan;
use crate::stats::window::WindowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ping,
    Config,
    Health,
    Source,
    Today,
    Totals,
    Queue,
    Sessions,
    System,
    Series(WindowKind),
    Top(TalkerSpan),
}

impl Endpoint {
    pub const ALL: [Self; 16] = [
        Self::Ping,
        Self::Config,
        Self::Health,
        Self::Source,
        Self::Today,
        Self::Totals,
        Self::Queue,
        Self::Sessions,
        Self::System,
        Self::Series(WindowKind::Live),
        Self::Series(WindowKind::Today),
        Self::Series(WindowKind::Week),
        Self::Series(WindowKind::Month),
        Self::Top(TalkerSpan::Day),
        Self::Top(TalkerSpan::Week),
        Self::Top(TalkerSpan::Month),
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Config => "config",
            Self::Health => "health",
            Self::Source => "source",
            Self::Today => "today",
            Self::Totals => "totals",
            Self::Queue => "queue",
            Self::Sessions => "sessions",
            Self::System => "system",
            Self::Series(WindowKind::Live) => "series_live",
            Self::Series(WindowKind::Today) => "series_today",
            Self::Series(WindowKind::Week) => "series_week",
            Self::Series(WindowKind::Month) => "series_month",
            Self::Top(TalkerSpan::Day) => "top_day",
            Self::Top(TalkerSpan::Week) => "top_week",
            Self::Top(TalkerSpan::Month) => "top_month",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = MpError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.as_str() == s)
            .ok_or_else(|| MpError::UnknownEndpoint {
                name: s.to_string(),
            })
    }
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestParams {
    /// Bypass the source decision cache (`?force=1`).
    pub force: bool,
}

/// HTTP status plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn unknown() -> Self {
        Self {
            status: 404,
            body: json!({ "error": "unknown_api" }),
        }
    }

    fn exception(message: &str) -> Self {
        Self {
            status: 500,
            body: json!({ "error": "exception", "message": message }),
        }
    }
}

/// Answer one named endpoint. Unknown names are a 404, never an error.
pub fn dispatch(
    monitor: &Monitor,
    name: &str,
    params: RequestParams,
    logger: &ActivityLoggerHandle,
) -> ApiResponse {
    let Ok(endpoint) = name.parse::<Endpoint>() else {
        return ApiResponse::unknown();
    };
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(monitor, endpoint, params)));
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match outcome {
        Ok(Ok(body)) => {
            logger.send(
                ActivityEntry::new(EventType::ApiRequest, Severity::Info)
                    .endpoint(endpoint.as_str())
                    .duration_ms(elapsed_ms),
            );
            ApiResponse::ok(body)
        }
        Ok(Err(error)) => {
            logger.send(
                ActivityEntry::new(EventType::ApiError, Severity::Error)
                    .endpoint(endpoint.as_str())
                    .duration_ms(elapsed_ms)
                    .error(&error),
            );
            ApiResponse::exception(&error.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            logger.send(
                ActivityEntry::new(EventType::ApiError, Severity::Error)
                    .endpoint(endpoint.as_str())
                    .duration_ms(elapsed_ms)
                    .details(format!("panic: {message}")),
            );
            ApiResponse::exception(&message)
        }
    }
}

fn run(monitor: &Monitor, endpoint: Endpoint, params: RequestParams) -> Result<Value> {
    match endpoint {
        Endpoint::Ping => to_value(&monitor.ping()),
        Endpoint::Config => to_value(&monitor.thresholds()),
        Endpoint::Health => to_value(&monitor.health()),
        Endpoint::Source => to_value(&monitor.source(params.force)),
        Endpoint::Today => to_value(&monitor.today()),
        Endpoint::Totals => to_value(&monitor.totals()),
        Endpoint::Queue => to_value(&monitor.queue()),
        Endpoint::Sessions => to_value(&monitor.sessions()),
        Endpoint::System => to_value(&monitor.system()),
        Endpoint::Series(kind) => to_value(&monitor.series(kind)),
        Endpoint::Top(span) => to_value(&monitor.top_talkers(span)),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
