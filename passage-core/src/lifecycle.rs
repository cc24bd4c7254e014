use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tracing::*;

use passage_common::types::exit_code;

type Hook = Box<dyn FnOnce() + Send>;

/// Ordered teardown hooks. `on_close` covers connection scope, `on_exit`
/// process scope; both run LIFO and each hook runs exactly once no matter
/// how many triggers race.
#[derive(Default)]
pub struct Lifecycle {
    on_exit: Mutex<Vec<Hook>>,
    on_close: Mutex<Vec<Hook>>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_exit(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut stack) = self.on_exit.lock() {
            stack.push(Box::new(hook));
        }
    }

    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut stack) = self.on_close.lock() {
            stack.push(Box::new(hook));
        }
    }

    /// Runs connection-scope teardown in reverse insertion order.
    pub fn run_close(&self) {
        Self::drain(&self.on_close);
    }

    /// Runs process-scope teardown (closing the connection first).
    pub fn run_exit(&self) {
        self.run_close();
        Self::drain(&self.on_exit);
    }

    fn drain(stack: &Mutex<Vec<Hook>>) {
        loop {
            // Take hooks one at a time so a hook may itself register or
            // trigger teardown without deadlocking.
            let hook = match stack.lock() {
                Ok(mut stack) => stack.pop(),
                Err(_) => return,
            };
            match hook {
                Some(hook) => hook(),
                None => return,
            }
        }
    }

    pub fn force_exit(&self, code: i32) -> ! {
        self.run_exit();
        std::process::exit(code);
    }

    /// Dedicated signal task: the first SIGINT/SIGTERM/SIGHUP tears the
    /// process down through the hook stacks.
    pub fn install_signal_handler(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => debug!("received SIGINT"),
                _ = sigterm.recv() => debug!("received SIGTERM"),
                _ = sighup.recv() => debug!("received SIGHUP"),
            }
            warn!("killed by signal");
            this.force_exit(exit_code::SIGNAL_KILL);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_lifo_order() {
        let lifecycle = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            lifecycle.on_close(move || order.lock().unwrap().push(i));
        }
        lifecycle.run_close();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_runs_exactly_once() {
        let lifecycle = Lifecycle::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            lifecycle.on_exit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        lifecycle.run_exit();
        lifecycle.run_exit();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exit_runs_close_first() {
        let lifecycle = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            lifecycle.on_exit(move || order.lock().unwrap().push("exit"));
        }
        {
            let order = order.clone();
            lifecycle.on_close(move || order.lock().unwrap().push("close"));
        }
        lifecycle.run_exit();
        assert_eq!(*order.lock().unwrap(), vec!["close", "exit"]);
    }

    #[test]
    fn test_hook_registering_during_drain() {
        let lifecycle = Lifecycle::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            let lifecycle2 = Arc::downgrade(&lifecycle);
            lifecycle.on_close(move || {
                count.fetch_add(1, Ordering::SeqCst);
                // registering from inside a hook must not deadlock
                if let Some(l) = lifecycle2.upgrade() {
                    l.on_close(|| {});
                }
            });
        }
        lifecycle.run_close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
