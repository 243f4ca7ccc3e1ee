//! Bounded pool of provider sessions.
//!
//! Sessions are created through a [`SessionFactory`] and validated before
//! reuse. `warm_up` pre-opens the minimum and must complete before the
//! ingress watcher is enabled; `drain` refuses new acquires and destroys
//! idle sessions during shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use vellum_core::error::{Error, Result};

/// Pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Sessions opened by `warm_up` and kept across idle sweeps.
    pub min_sessions: usize,
    /// Hard cap on open sessions.
    pub max_sessions: usize,
    /// Idle sessions older than this are destroyed on the next acquire.
    pub idle_timeout: Duration,
    /// How long an acquire waits for a free session before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 4,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle hooks for pooled sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// The pooled session type.
    type Session: Send + 'static;

    /// Opens one session.
    async fn create(&self) -> Result<Self::Session>;

    /// Closes a session.
    async fn destroy(&self, session: Self::Session);

    /// Liveness probe; invalid sessions are destroyed instead of reused.
    async fn validate(&self, session: &Self::Session) -> bool;
}

struct IdleSession<S> {
    session: S,
    idle_since: Instant,
}

struct PoolState<S> {
    idle: VecDeque<IdleSession<S>>,
    total: usize,
}

struct Shared<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Session>>,
    freed: Notify,
    draining: AtomicBool,
}

/// Bounded session pool.
pub struct ConnectionPool<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> ConnectionPool<F> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                }),
                freed: Notify::new(),
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Pre-opens the minimum number of sessions.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure; already-opened sessions stay in
    /// the pool.
    pub async fn warm_up(&self) -> Result<()> {
        for _ in 0..self.shared.config.min_sessions {
            let session = self.shared.factory.create().await?;
            let mut state = lock(&self.shared.state);
            state.idle.push_back(IdleSession {
                session,
                idle_since: Instant::now(),
            });
            state.total += 1;
        }
        Ok(())
    }

    /// Acquires a session, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// [`Error::PoolDraining`] during shutdown, [`Error::PoolTimeout`] when
    /// no session frees up in time, or the factory's creation error.
    pub async fn acquire(&self) -> Result<PooledSession<F>> {
        let deadline = Instant::now() + self.shared.config.acquire_timeout;

        loop {
            if self.shared.draining.load(Ordering::Acquire) {
                return Err(Error::PoolDraining);
            }

            enum Step<S> {
                Reuse(S),
                Expired(S),
                Create,
                Wait,
            }

            let step = {
                let mut state = lock(&self.shared.state);
                if let Some(idle) = state.idle.pop_front() {
                    if idle.idle_since.elapsed() > self.shared.config.idle_timeout {
                        state.total -= 1;
                        Step::Expired(idle.session)
                    } else {
                        Step::Reuse(idle.session)
                    }
                } else if state.total < self.shared.config.max_sessions {
                    // Reserve the slot before the await.
                    state.total += 1;
                    Step::Create
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Reuse(session) => {
                    if self.shared.factory.validate(&session).await {
                        return Ok(PooledSession {
                            shared: Arc::clone(&self.shared),
                            session: Some(session),
                        });
                    }
                    self.shared.factory.destroy(session).await;
                    lock(&self.shared.state).total -= 1;
                }
                Step::Expired(session) => {
                    self.shared.factory.destroy(session).await;
                }
                Step::Create => match self.shared.factory.create().await {
                    Ok(session) => {
                        return Ok(PooledSession {
                            shared: Arc::clone(&self.shared),
                            session: Some(session),
                        });
                    }
                    Err(e) => {
                        lock(&self.shared.state).total -= 1;
                        self.shared.freed.notify_one();
                        return Err(e);
                    }
                },
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolTimeout {
                            waited_ms: self.shared.config.acquire_timeout.as_millis() as u64,
                        });
                    }
                    let notified = self.shared.freed.notified();
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::PoolTimeout {
                            waited_ms: self.shared.config.acquire_timeout.as_millis() as u64,
                        });
                    }
                }
            }
        }
    }

    /// Refuses new acquires and destroys all idle sessions.
    pub async fn drain(&self) {
        self.shared.draining.store(true, Ordering::Release);
        // Wake every waiter so they observe the drain.
        self.shared.freed.notify_waiters();

        loop {
            let idle = {
                let mut state = lock(&self.shared.state);
                match state.idle.pop_front() {
                    Some(idle) => {
                        state.total -= 1;
                        Some(idle.session)
                    }
                    None => None,
                }
            };
            match idle {
                Some(session) => self.shared.factory.destroy(session).await,
                None => break,
            }
        }
    }

    /// Open session count (idle + checked out).
    #[must_use]
    pub fn total_sessions(&self) -> usize {
        lock(&self.shared.state).total
    }

    /// Idle session count.
    #[must_use]
    pub fn idle_sessions(&self) -> usize {
        lock(&self.shared.state).idle.len()
    }
}

fn lock<S>(mutex: &Mutex<PoolState<S>>) -> std::sync::MutexGuard<'_, PoolState<S>> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A checked-out session; returns to the pool on drop.
pub struct PooledSession<F: SessionFactory> {
    shared: Arc<Shared<F>>,
    session: Option<F::Session>,
}

impl<F: SessionFactory> PooledSession<F> {
    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &F::Session {
        self.session
            .as_ref()
            .unwrap_or_else(|| unreachable!("session taken before drop"))
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let mut state = lock(&self.shared.state);
            if self.shared.draining.load(Ordering::Acquire) {
                // Synchronous drop of the session; drain already swept the
                // idle list.
                state.total -= 1;
                drop(state);
                drop(session);
            } else {
                state.idle.push_back(IdleSession {
                    session,
                    idle_since: Instant::now(),
                });
                drop(state);
                self.shared.freed.notify_one();
            }
        }
    }
}
