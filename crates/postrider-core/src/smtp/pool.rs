//! SMTP connection pool
//!
//! Owns a small set of authenticated sessions. A checkout is exclusive: the
//! permit rides inside the [`PooledConnection`] and is only surrendered when
//! the connection is released or discarded, so no two senders can hold the
//! same session. Sessions are retired after a fixed number of sends or when
//! a liveness probe fails; a session that saw a connection-level or fatal
//! failure is closed instead of returned.

use super::{MailEnvelope, SessionFactory, SmtpFailure, SmtpReply, SmtpSession};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

struct IdleSession<S> {
    session: S,
    id: u64,
    created_at: Instant,
    sends: u32,
}

/// An exclusive checkout of one authenticated session.
pub struct PooledConnection<S: SmtpSession> {
    session: S,
    id: u64,
    created_at: Instant,
    sends: u32,
    _permit: OwnedSemaphorePermit,
}

impl<S: SmtpSession> PooledConnection<S> {
    /// Numeric identity of the underlying session; survives reuse, changes
    /// on rotation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sends performed over this session since it was opened.
    pub fn sends(&self) -> u32 {
        self.sends
    }

    /// Age of the underlying session.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Transmit one message over this session.
    pub async fn send(
        &mut self,
        envelope: &MailEnvelope,
        message: &[u8],
    ) -> Result<SmtpReply, SmtpFailure> {
        let reply = self.session.send(envelope, message).await?;
        self.sends += 1;
        Ok(reply)
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently open sessions.
    pub max_connections: usize,
    /// Sends after which a session is retired.
    pub rotate_after_sends: u32,
}

/// Connection pool over a [`SessionFactory`].
pub struct ConnectionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<Vec<IdleSession<F::Session>>>,
    semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl<F: SessionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let permits = config.max_connections.max(1);
        Self {
            factory,
            config,
            idle: Mutex::new(Vec::with_capacity(permits)),
            semaphore: Arc::new(Semaphore::new(permits)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Check out a live session, reusing an idle one when it is both under
    /// its rotation threshold and answers a liveness probe, otherwise
    /// opening a fresh one. Blocks while the pool is saturated.
    pub async fn acquire(&self) -> Result<PooledConnection<F::Session>, SmtpFailure> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SmtpFailure::connect("connection pool is closed"))?;

        loop {
            let candidate = { self.idle.lock().await.pop() };
            let Some(mut idle) = candidate else { break };

            if idle.sends >= self.config.rotate_after_sends {
                debug!(
                    "retiring session #{} after {} sends",
                    idle.id, idle.sends
                );
                idle.session.close().await;
                continue;
            }

            if !idle.session.is_alive().await {
                debug!("dropping stale session #{}", idle.id);
                idle.session.close().await;
                continue;
            }

            debug!("reusing session #{} ({} sends)", idle.id, idle.sends);
            return Ok(PooledConnection {
                session: idle.session,
                id: idle.id,
                created_at: idle.created_at,
                sends: idle.sends,
                _permit: permit,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("opening session #{}", id);
        let session = self.factory.connect().await?;
        Ok(PooledConnection {
            session,
            id,
            created_at: Instant::now(),
            sends: 0,
            _permit: permit,
        })
    }

    /// Return a session to the pool. Unhealthy sessions and sessions at the
    /// rotation threshold are closed instead.
    pub async fn release(&self, mut conn: PooledConnection<F::Session>, healthy: bool) {
        if healthy && conn.sends < self.config.rotate_after_sends {
            let mut idle = self.idle.lock().await;
            idle.push(IdleSession {
                session: conn.session,
                id: conn.id,
                created_at: conn.created_at,
                sends: conn.sends,
            });
            return;
        }
        debug!(
            "closing session #{} on release (healthy: {}, sends: {})",
            conn.id, healthy, conn.sends
        );
        conn.session.close().await;
    }

    /// Force-close a session after a connection-level or fatal failure so a
    /// broken transaction state is never reused.
    pub async fn invalidate(&self, mut conn: PooledConnection<F::Session>) {
        warn!("invalidating session #{}", conn.id);
        conn.session.close().await;
    }

    /// Sessions currently checked out.
    pub fn active_connections(&self) -> usize {
        self.config.max_connections.max(1) - self.semaphore.available_permits()
    }

    /// Acquire, probe and release one session without sending anything.
    pub async fn self_test(&self) -> Result<(), SmtpFailure> {
        let conn = self.acquire().await?;
        self.release(conn, true).await;
        Ok(())
    }

    /// Close every idle session.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for mut entry in idle.drain(..) {
            entry.session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Session that accepts everything and records its factory-assigned id.
    struct CountingSession {
        serial: usize,
        alive: Arc<AtomicBool>,
        in_use: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SmtpSession for CountingSession {
        async fn send(
            &mut self,
            _envelope: &MailEnvelope,
            _message: &[u8],
        ) -> Result<SmtpReply, SmtpFailure> {
            // Flag overlapping use of a single session.
            assert!(
                !self.in_use.swap(true, Ordering::SeqCst),
                "session used by two callers at once"
            );
            tokio::task::yield_now().await;
            self.in_use.store(false, Ordering::SeqCst);
            Ok(SmtpReply {
                code: 250,
                message: "OK".to_string(),
            })
        }

        async fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&mut self) {}
    }

    struct CountingFactory {
        opened: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                opened: Arc::new(AtomicUsize::new(0)),
                alive: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        type Session = CountingSession;

        async fn connect(&self) -> Result<Self::Session, SmtpFailure> {
            let serial = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(CountingSession {
                serial,
                alive: self.alive.clone(),
                in_use: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    fn envelope() -> MailEnvelope {
        MailEnvelope {
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reuse_keeps_identity() {
        let pool = ConnectionPool::new(
            CountingFactory::new(),
            PoolConfig {
                max_connections: 1,
                rotate_after_sends: 10,
            },
        );

        let mut conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        conn.send(&envelope(), b"x").await.unwrap();
        pool.release(conn, true).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(conn.sends(), 1);
        pool.release(conn, true).await;
    }

    #[tokio::test]
    async fn test_rotation_threshold_yields_fresh_identity() {
        let pool = ConnectionPool::new(
            CountingFactory::new(),
            PoolConfig {
                max_connections: 1,
                rotate_after_sends: 2,
            },
        );

        let mut conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        conn.send(&envelope(), b"x").await.unwrap();
        pool.release(conn, true).await;

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        conn.send(&envelope(), b"x").await.unwrap();
        // Now at the threshold: release closes it...
        pool.release(conn, true).await;

        // ...and the third acquire must yield a distinct session.
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first_id);
        assert_eq!(conn.sends(), 0);
        pool.release(conn, true).await;
    }

    #[tokio::test]
    async fn test_unhealthy_release_discards() {
        let factory = CountingFactory::new();
        let opened = factory.opened.clone();
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: 1,
                rotate_after_sends: 10,
            },
        );

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;
        let conn = pool.acquire().await.unwrap();
        pool.invalidate(conn).await;
        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;

        assert_eq!(opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stale_idle_session_is_replaced() {
        let factory = CountingFactory::new();
        let alive = factory.alive.clone();
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: 1,
                rotate_after_sends: 10,
            },
        );

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        pool.release(conn, true).await;

        alive.store(false, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), first_id);
        pool.release(conn, true).await;
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_are_exclusive() {
        let pool = Arc::new(ConnectionPool::new(
            CountingFactory::new(),
            PoolConfig {
                max_connections: 2,
                rotate_after_sends: 1000,
            },
        ));

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            let seen = seen.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let mut conn = pool.acquire().await.unwrap();
                    conn.send(&envelope(), b"x").await.unwrap();
                    seen.lock().await.insert(conn.session.serial);
                    pool.release(conn, true).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // The cap held: at most two distinct sessions ever existed.
        assert!(seen.lock().await.len() <= 2);
        assert_eq!(pool.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_self_test() {
        let pool = ConnectionPool::new(
            CountingFactory::new(),
            PoolConfig {
                max_connections: 1,
                rotate_after_sends: 10,
            },
        );
        pool.self_test().await.unwrap();
        assert_eq!(pool.active_connections(), 0);
    }
}
