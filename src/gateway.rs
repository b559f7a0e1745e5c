//! Quota-aware access to external APIs.
//!
//! [`TokenRotation`] is a plain state machine over an ordered credential list.
//! [`ApiGateway`] drives an operation through it: quota errors exhaust the
//! current credential and retry on the next one, transient errors go through
//! the shared [`RetryPolicy`], everything else surfaces immediately.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::GatewayError;
use crate::models::CredentialUsage;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct TokenRotation {
    tokens: Vec<String>,
    current: usize,
    exhausted: HashSet<usize>,
}

impl TokenRotation {
    /// An empty list becomes a single anonymous credential, for services
    /// that need no key.
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens = if tokens.is_empty() {
            vec![String::new()]
        } else {
            tokens
        };
        Self {
            tokens,
            current: 0,
            exhausted: HashSet::new(),
        }
    }

    /// The token to use now, or `None` once every token is exhausted.
    pub fn current(&self) -> Option<&str> {
        if self.exhausted.contains(&self.current) {
            None
        } else {
            self.tokens.get(self.current).map(String::as_str)
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted.insert(self.current);
    }

    /// Advance to the next non-exhausted token, wrapping around.
    pub fn next_token(&mut self) -> Option<&str> {
        let len = self.tokens.len();
        let next = (1..=len)
            .map(|step| (self.current + step) % len)
            .find(|idx| !self.exhausted.contains(idx))?;
        self.current = next;
        self.tokens.get(next).map(String::as_str)
    }

    pub fn all_exhausted(&self) -> bool {
        self.exhausted.len() >= self.tokens.len()
    }

    pub fn is_exhausted(&self, index: usize) -> bool {
        self.exhausted.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }
}

/// Run-wide cap on outbound calls, shared by every gateway.
#[derive(Debug)]
pub struct CallBudget {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl CallBudget {
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(None)
    }

    pub fn try_take(&self) -> Result<(), GatewayError> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used < limit).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| GatewayError::CallCapReached(limit))
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Extraction,
    Geocoding,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Extraction => "extraction",
            CallKind::Geocoding => "geocoding",
        }
    }
}

pub struct ApiGateway {
    kind: CallKind,
    rotation: TokenRotation,
    successes: Vec<usize>,
    retry: RetryPolicy,
    budget: Arc<CallBudget>,
}

impl ApiGateway {
    pub fn new(
        kind: CallKind,
        tokens: Vec<String>,
        retry: RetryPolicy,
        budget: Arc<CallBudget>,
    ) -> Self {
        let rotation = TokenRotation::new(tokens);
        let successes = vec![0; rotation.len()];
        Self {
            kind,
            rotation,
            successes,
            retry,
            budget,
        }
    }

    /// Run `op` with the current credential, rotating on quota errors.
    ///
    /// Each credential is tried at most once per call, and every attempt on it
    /// takes from the [`CallBudget`]. When none is left the result is
    /// [`GatewayError::QuotaExhausted`], and later calls fail the same way
    /// without touching the network.
    pub async fn call_with_resilience<T, F, Fut>(&mut self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        while let Some(token) = self.rotation.current().map(str::to_owned) {
            let index = self.rotation.current_index();
            let budget = &self.budget;

            // Every attempt, retries included, is an outbound request.
            let outcome = self
                .retry
                .run(self.kind.as_str(), GatewayError::is_transient, || {
                    let request = budget.try_take().map(|()| op(token.clone()));
                    async move { request?.await }
                })
                .await;

            match outcome {
                Ok(value) => {
                    self.successes[index] += 1;
                    return Ok(value);
                }
                Err(GatewayError::Quota(reason)) => {
                    warn!(
                        kind = self.kind.as_str(),
                        credential = %mask(&token),
                        reason = reason.as_str(),
                        "Credential quota exhausted"
                    );
                    self.rotation.mark_exhausted();
                    match self.rotation.next_token() {
                        Some(next) => info!(
                            kind = self.kind.as_str(),
                            credential = %mask(next),
                            "Rotated to next credential"
                        ),
                        None => break,
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(GatewayError::QuotaExhausted)
    }

    pub fn all_exhausted(&self) -> bool {
        self.rotation.all_exhausted()
    }

    pub fn usage(&self) -> Vec<CredentialUsage> {
        (0..self.rotation.len())
            .map(|index| CredentialUsage {
                kind: self.kind.as_str().to_string(),
                credential: mask(self.rotation.token(index).unwrap_or_default()),
                successful_calls: self.successes[index],
                exhausted: self.rotation.is_exhausted(index),
            })
            .collect()
    }
}

/// Never log or persist full credentials.
fn mask(token: &str) -> String {
    if token.is_empty() {
        return "anonymous".to_string();
    }
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}
