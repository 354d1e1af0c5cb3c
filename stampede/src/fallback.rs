//! Ordered lookups where the first success wins.
//!
//! Used wherever a value can come from several places, e.g. a fixture read
//! from a local file or else fetched from an endpoint, or a question count
//! probed on `/me` and then on the detail endpoint.
use std::{fmt, future::Future, time::Duration};

use futures::future::BoxFuture;

type Lookup<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, String>> + Send + 'a>;

struct Step<'a, T> {
    name: String,
    timeout: Duration,
    lookup: Lookup<'a, T>,
}

/// Why one step of a chain did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub name: String,
    pub failure: String,
}

/// Every step of a chain failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("all {} lookups failed: {}", .attempts.len(), render(.attempts))]
pub struct Exhausted {
    pub attempts: Vec<Attempt>,
}

fn render(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.name, a.failure))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A chain of lookups tried in declaration order.
///
/// Each step has its own timeout. A step runs only if every step before it
/// failed or timed out.
pub struct FallbackChain<'a, T> {
    steps: Vec<Step<'a, T>>,
}

impl<'a, T: Send + 'a> FallbackChain<'a, T> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn then<F, Fut, E>(mut self, name: impl Into<String>, timeout: Duration, lookup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, E>> + Send + 'a,
        E: fmt::Display,
    {
        self.steps.push(Step {
            name: name.into(),
            timeout,
            lookup: Box::new(move || {
                Box::pin(async move { lookup().await.map_err(|e| e.to_string()) })
            }),
        });
        self
    }

    pub async fn resolve(self) -> Result<T, Exhausted> {
        let mut attempts = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            let failure = match tokio::time::timeout(step.timeout, (step.lookup)()).await {
                Ok(Ok(value)) => {
                    tracing::debug!("Lookup `{}` resolved", step.name);
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => format!("timed out after {:?}", step.timeout),
            };
            tracing::debug!("Lookup `{}` failed: {failure}", step.name);
            attempts.push(Attempt {
                name: step.name,
                failure,
            });
        }
        Err(Exhausted { attempts })
    }
}

impl<'a, T: Send + 'a> Default for FallbackChain<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}
