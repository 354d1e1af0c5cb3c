//! Setup-time fixtures.
//!
//! A [`Setup`] runs exactly once, before any VU exists, and produces the value
//! every iteration later reads through `&D`. There is no partial fixture: if
//! setup fails, the run never starts.
use std::future::Future;

/// A fixture could not be produced.
///
/// Carries what was asked for and what came back so an operator can tell a
/// misconfigured URL from an empty data set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} ({requested}){}", got(.response))]
pub struct SetupError {
    pub requested: String,
    /// Status line and body excerpt of the last response, if one arrived.
    pub response: Option<String>,
    pub reason: String,
}

/// Longest response body excerpt kept in a [`SetupError`].
const EXCERPT_LEN: usize = 200;

impl SetupError {
    pub fn new(requested: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            requested: requested.into(),
            response: None,
            reason: reason.into(),
        }
    }

    /// A response arrived but was not usable.
    pub fn http(
        requested: impl Into<String>,
        status: u16,
        body: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            requested: requested.into(),
            response: Some(format!("{status}: {}", excerpt(body))),
            reason: reason.into(),
        }
    }
}

fn got(response: &Option<String>) -> String {
    response
        .as_deref()
        .map(|r| format!(", got {r}"))
        .unwrap_or_default()
}

pub(crate) fn excerpt(body: &str) -> &str {
    if body.len() <= EXCERPT_LEN {
        return body;
    }
    let mut end = EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Produces the run fixture.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<D, SetupError>>`,
/// so a closure is usually enough:
///
/// ```no_run
/// # use stampede::fixture::{Setup, SetupError};
/// let setup = || async { Ok::<_, SetupError>(vec!["room-1".to_owned()]) };
/// ```
pub trait Setup<D>: Send + Sync {
    fn setup(&self) -> impl Future<Output = Result<D, SetupError>> + Send;
}

impl<D, F, Fut> Setup<D> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<D, SetupError>> + Send,
{
    fn setup(&self) -> impl Future<Output = Result<D, SetupError>> + Send {
        self()
    }
}

/// Setup for runs that need no fixture.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSetup;

impl Setup<()> for NoSetup {
    async fn setup(&self) -> Result<(), SetupError> {
        Ok(())
    }
}
