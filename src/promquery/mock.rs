// Scripted metrics backend
//
// Deterministic stand-in for Prometheus. Each query string is bound to a
// script that yields the next value on every call; the backend counts calls
// per query so pollers can be checked for deduplication and shutdown.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use super::{MetricsBackend, QueryError, QueryValue};

#[derive(Debug, Clone)]
enum Script {
    Constant(f64),
    /// Decrements before answering, so the first answer is `start - step`
    Countdown { next: f64, step: f64 },
    /// Plays values in order, then repeats the last one
    Sequence(VecDeque<f64>),
    Value(QueryValue),
    Fail(String),
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constant(self, query: impl Into<String>, value: f64) -> Self {
        self.script(query, Script::Constant(value))
    }

    pub fn with_countdown(self, query: impl Into<String>, start: f64, step: f64) -> Self {
        self.script(query, Script::Countdown { next: start, step })
    }

    pub fn with_sequence(self, query: impl Into<String>, values: impl IntoIterator<Item = f64>) -> Self {
        self.script(query, Script::Sequence(values.into_iter().collect()))
    }

    /// Answer with a raw result, e.g. a vector that is not scalar-valued
    pub fn with_value(self, query: impl Into<String>, value: QueryValue) -> Self {
        self.script(query, Script::Value(value))
    }

    pub fn with_error(self, query: impl Into<String>, message: impl Into<String>) -> Self {
        self.script(query, Script::Fail(message.into()))
    }

    fn script(self, query: impl Into<String>, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(query.into(), script);
        self
    }

    /// Number of times `query` has been executed
    pub fn calls(&self, query: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(query)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait]
impl MetricsBackend for ScriptedBackend {
    async fn query(&self, query: &str, _ts: DateTime<Utc>) -> Result<QueryValue, QueryError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(query.to_string())
            .or_insert(0) += 1;

        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let script = scripts
            .get_mut(query)
            .ok_or_else(|| QueryError::Backend(format!("no script for query {:?}", query)))?;

        match script {
            Script::Constant(v) => Ok(QueryValue::Scalar(*v)),
            Script::Countdown { next, step } => {
                *next -= *step;
                Ok(QueryValue::Scalar(*next))
            }
            Script::Sequence(values) => {
                let value = if values.len() > 1 {
                    values.pop_front()
                } else {
                    values.front().copied()
                };
                value
                    .map(QueryValue::Scalar)
                    .ok_or_else(|| QueryError::Backend("empty sequence".to_string()))
            }
            Script::Value(v) => Ok(v.clone()),
            Script::Fail(msg) => Err(QueryError::Backend(msg.clone())),
        }
    }
}
