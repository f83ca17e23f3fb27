//! Scoped signal suppression
//!
//! While the bridge runs, keystrokes like Ctrl+C must travel down the SSH
//! channel to the remote shell rather than kill the local process. The
//! terminal still delivers SIGINT/SIGQUIT/SIGTSTP to the whole foreground
//! process group, so the bridge ignores them for the duration of a
//! [`SignalGuard`] and puts the previous dispositions back when it drops.
//!
//! Signal dispositions are process-wide: hold at most one guard at a time.

use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Signals the bridge shields itself from
#[cfg(unix)]
pub const SUPPRESSED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTSTP];

/// Ignores terminal-generated signals until dropped
#[must_use = "signals are restored as soon as the guard is dropped"]
pub struct SignalGuard {
    #[cfg(unix)]
    previous: Vec<(Signal, SigAction)>,
}

impl SignalGuard {
    /// Install ignore dispositions, remembering what was there before
    #[cfg(unix)]
    pub fn acquire() -> std::io::Result<Self> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let mut guard = Self {
            previous: Vec::with_capacity(SUPPRESSED_SIGNALS.len()),
        };

        for signal in SUPPRESSED_SIGNALS {
            // SAFETY: SIG_IGN installs no user code; the previous action is
            // restored verbatim on drop.
            match unsafe { sigaction(signal, &ignore) } {
                Ok(previous) => guard.previous.push((signal, previous)),
                Err(errno) => {
                    // Dropping `guard` restores whatever was already replaced
                    return Err(std::io::Error::from(errno));
                }
            }
        }

        debug!("Ignoring {:?} while the bridge runs", SUPPRESSED_SIGNALS);
        Ok(guard)
    }

    /// Windows delivers Ctrl+C as a console event, not a signal; nothing to do
    #[cfg(not(unix))]
    pub fn acquire() -> std::io::Result<Self> {
        Ok(Self {})
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        for (signal, previous) in self.previous.drain(..).rev() {
            // SAFETY: re-installs the exact action that was active before acquire.
            if let Err(errno) = unsafe { sigaction(signal, &previous) } {
                warn!("Failed to restore handler for {:?}: {}", signal, errno);
            }
        }
        debug!("Signal handlers restored");
    }
}
