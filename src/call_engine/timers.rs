//! Timeout Supervisor
//!
//! Höchstens ein Timer ist gleichzeitig aktiv. Ein neuer `arm` bricht den
//! vorherigen ab, jeder Ablauf trägt eine Generation, damit ein bereits
//! abgebrochener Timer nicht noch nachträglich zugestellt wird.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Art des Timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Ausgehender Anruf wird nicht angenommen
    Dial,
    /// Eingehender Anruf wird nicht angenommen
    Ring,
}

/// Ein abgelaufener Timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    pub kind: TimerKind,
    pub generation: u64,
}

pub type ExpiryHandler = Arc<dyn Fn(TimerExpired) + Send + Sync>;

struct ArmedTimer {
    kind: TimerKind,
    generation: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

pub struct TimeoutSupervisor {
    on_expiry: ExpiryHandler,
    generation: u64,
    armed: Option<ArmedTimer>,
}

impl TimeoutSupervisor {
    pub fn new(on_expiry: ExpiryHandler) -> Self {
        Self {
            on_expiry,
            generation: 0,
            armed: None,
        }
    }

    /// Startet einen Timer, ein laufender Timer wird vorher abgebrochen
    pub fn arm(&mut self, kind: TimerKind, after: Duration) -> u64 {
        self.disarm();

        self.generation += 1;
        let expired = TimerExpired {
            kind,
            generation: self.generation,
        };
        let on_expiry = Arc::clone(&self.on_expiry);
        let deadline = Instant::now() + after;

        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_expiry(expired);
        });

        tracing::debug!("{:?} timer armed for {:?}", kind, after);

        self.armed = Some(ArmedTimer {
            kind,
            generation: self.generation,
            deadline,
            task,
        });
        self.generation
    }

    pub fn disarm(&mut self) {
        if let Some(timer) = self.armed.take() {
            timer.task.abort();
            tracing::trace!("{:?} timer disarmed", timer.kind);
        }
    }

    /// Prüft ob ein Ablauf zum aktuell gesetzten Timer gehört und verbraucht ihn
    pub fn accept(&mut self, expired: &TimerExpired) -> bool {
        match &self.armed {
            Some(timer) if timer.generation == expired.generation => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn armed(&self) -> Option<TimerKind> {
        self.armed.as_ref().map(|t| t.kind)
    }

    /// Restzeit des aktiven Timers
    pub fn remaining(&self) -> Option<Duration> {
        self.armed
            .as_ref()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for TimeoutSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutSupervisor")
            .field("armed", &self.armed())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn supervisor() -> (TimeoutSupervisor, mpsc::UnboundedReceiver<TimerExpired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ExpiryHandler = Arc::new(move |expired| {
            let _ = tx.send(expired);
        });
        (TimeoutSupervisor::new(handler), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_deadline() {
        let (mut timers, mut rx) = supervisor();
        let generation = timers.arm(TimerKind::Dial, Duration::from_secs(45));

        let started = Instant::now();
        let expired = rx.recv().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(expired.generation, generation);
        assert!(timers.accept(&expired));
        assert!(!timers.accept(&expired));
        assert_eq!(timers.armed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let (mut timers, mut rx) = supervisor();
        timers.arm(TimerKind::Ring, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = timers.arm(TimerKind::Dial, Duration::from_secs(10));

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired.kind, TimerKind::Dial);
        assert_eq!(expired.generation, second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_expiry() {
        let (mut timers, mut rx) = supervisor();
        timers.arm(TimerKind::Dial, Duration::from_secs(1));
        timers.disarm();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
