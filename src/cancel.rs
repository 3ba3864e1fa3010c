use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Monotonic cancellation flag shared by every stage of a run.
///
/// Cloning shares the flag. A token made with [`CancellationToken::child`]
/// observes its parent but cancelling the child leaves the parent untouched,
/// which lets a single job stop itself without ending the whole run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Set the flag. There is no way back.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// Trip `token` on the first Ctrl-C. A second Ctrl-C exits the process
/// without waiting for items still in flight.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    std::thread::Builder::new()
        .name("dre-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if interrupt(&token) {
                        tracing::error!("Interrupted again, exiting now");
                        std::process::exit(130);
                    }
                }
            });
        })?;
    Ok(())
}

/// Returns true when the run was already cancelled, i.e. on a repeat.
fn interrupt(token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return true;
    }
    tracing::warn!("Aborted by user request, press Ctrl-C again to exit immediately");
    token.cancel();
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_child_sees_parent_but_not_reverse() {
        let run = CancellationToken::new();
        let job = run.child();
        job.cancel();
        assert!(job.is_cancelled());
        assert!(!run.is_cancelled());

        let job2 = run.child();
        run.cancel();
        assert!(job2.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_second_interrupt_asks_for_exit() {
        let token = CancellationToken::new();
        assert!(!interrupt(&token));
        assert!(token.is_cancelled());
        assert!(interrupt(&token));
    }
}
