use super::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Background keepalive that reports a lost transport once.
///
/// Started only after the shell sanity check passed. Stopping the monitor
/// before closing the transport suppresses the notification.
pub struct KeepaliveMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveMonitor {
    pub fn start<F>(transport: Arc<dyn Transport>, interval: Duration, on_lost: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::spawn(move || {
            let mut last_keepalive = Instant::now();
            loop {
                thread::sleep(POLL_INTERVAL);
                if stop_flag.load(Ordering::SeqCst) {
                    return;
                }

                let alive = if !transport.is_connected() {
                    false
                } else if last_keepalive.elapsed() >= interval {
                    last_keepalive = Instant::now();
                    match transport.keepalive() {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!("Keepalive failed: {}", e);
                            false
                        }
                    }
                } else {
                    true
                };

                if !alive {
                    if !stop_flag.load(Ordering::SeqCst) {
                        tracing::info!("Transport lost, notifying listener");
                        on_lost();
                    }
                    return;
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepaliveMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::ScriptedTransport;
    use std::sync::mpsc;

    #[test]
    fn test_reports_lost_transport() {
        let transport = ScriptedTransport::new();
        let (tx, rx) = mpsc::channel();
        let _monitor = KeepaliveMonitor::start(transport.clone(), Duration::from_secs(60), move || {
            let _ = tx.send(());
        });

        transport.close();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_stop_suppresses_notification() {
        let transport = ScriptedTransport::new();
        let (tx, rx) = mpsc::channel::<()>();
        let mut monitor = KeepaliveMonitor::start(transport.clone(), Duration::from_secs(60), move || {
            let _ = tx.send(());
        });

        monitor.stop();
        transport.close();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
