//! Inject - Run a command with secrets in its environment
//!
//! The child inherits the parent's environment and standard streams. Secrets
//! are layered on top, so a secret shadows an ambient variable of the same
//! name. While the child runs, SIGINT and SIGTERM delivered to this process
//! are relayed to it. Once it exits, both signals get back the disposition
//! they had before forwarding started.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::ptr;
use std::sync::{Mutex, PoisonError};
use tokio::process::Command;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::vault::SecretMap;

/// Build a child environment: `parent` first, then every secret.
///
/// Later definitions win, so secrets take precedence over inherited variables.
pub fn merge_env<I, K, V>(parent: I, secrets: &SecretMap) -> BTreeMap<OsString, OsString>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut env: BTreeMap<OsString, OsString> = parent
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    for (key, value) in secrets {
        env.insert(OsString::from(key), OsString::from(value));
    }

    env
}

/// Run `command` with `secrets` injected and wait for it to finish.
///
/// A nonzero exit becomes [`Error::ChildExit`] carrying the exact code; a
/// child killed by a signal reports `128 + signo`. A command that cannot be
/// launched at all is [`Error::StartFailure`].
///
/// Signal forwarding starts only after the child has been spawned. A SIGINT
/// or SIGTERM arriving in the short window between spawn and registration
/// reaches this process alone; closing that gap would need process-group
/// handling and is not attempted.
pub async fn run(command: &[String], secrets: &SecretMap) -> Result<()> {
    let (program, args) = command.split_first().ok_or(Error::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(merge_env(std::env::vars_os(), secrets))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|source| Error::StartFailure {
        program: program.clone(),
        source,
    })?;

    let pid = child.id();
    debug!(?pid, %program, secrets = secrets.len(), "child started");

    let forwarder = match pid.map(SignalForwarder::spawn).transpose() {
        Ok(forwarder) => forwarder,
        Err(err) => {
            warn!(error = %err, "failed to register signal handlers, stopping child");
            child.start_kill().ok();
            child.wait().await.ok();
            return Err(err.into());
        }
    };

    let status = child.wait().await;

    if let Some(forwarder) = forwarder {
        forwarder.shutdown().await;
    }

    exit_result(status?)
}

fn exit_result(status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }

    let code = match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => 1,
    };
    debug!(code, "child exited unsuccessfully");
    Err(Error::ChildExit { code })
}

const FORWARDED: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

/// Process-wide bookkeeping for the forwarded signals' dispositions
struct Dispositions {
    /// Live forwarders
    active: usize,
    /// What each signal did before the first live forwarder registered
    saved: BTreeMap<libc::c_int, libc::sigaction>,
    /// The runtime's handler, reinstalled when forwarding starts again
    runtime: BTreeMap<libc::c_int, libc::sigaction>,
}

static DISPOSITIONS: Mutex<Dispositions> = Mutex::new(Dispositions {
    active: 0,
    saved: BTreeMap::new(),
    runtime: BTreeMap::new(),
});

fn current_action(signo: libc::c_int) -> io::Result<libc::sigaction> {
    // SAFETY: a null new action only queries; `old` is a valid out pointer.
    unsafe {
        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(signo, ptr::null(), &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

fn install_action(signo: libc::c_int, action: &libc::sigaction) -> io::Result<()> {
    // SAFETY: `action` was read back from sigaction(2) for this signal.
    if unsafe { libc::sigaction(signo, action, ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Claim SIGINT and SIGTERM for forwarding.
///
/// The first live claim records the current dispositions. tokio installs its
/// own handler once per process and never again, so after a release the
/// handler it installed is put back by hand.
fn acquire_signals() -> io::Result<(Signal, Signal)> {
    let mut state = DISPOSITIONS.lock().unwrap_or_else(PoisonError::into_inner);

    if state.active == 0 {
        for signo in FORWARDED {
            let action = current_action(signo)?;
            state.saved.insert(signo, action);
        }
    }

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    );
    let (interrupt, terminate) = match streams {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(err), _) | (_, Err(err)) => {
            if state.active == 0 {
                restore_saved(&state);
            }
            return Err(err);
        }
    };

    for signo in FORWARDED {
        if let Some(action) = state.runtime.get(&signo) {
            install_action(signo, action)?;
        } else {
            let action = current_action(signo)?;
            state.runtime.insert(signo, action);
        }
    }

    state.active += 1;
    Ok((interrupt, terminate))
}

/// Drop one claim. The last one out restores the recorded dispositions.
fn release_signals() {
    let mut state = DISPOSITIONS.lock().unwrap_or_else(PoisonError::into_inner);
    state.active = state.active.saturating_sub(1);
    if state.active == 0 {
        restore_saved(&state);
    }
}

fn restore_saved(state: &Dispositions) {
    for (signo, action) in &state.saved {
        if let Err(err) = install_action(*signo, action) {
            warn!(signo, error = %err, "failed to restore signal disposition");
        }
    }
}

/// Background task relaying SIGINT and SIGTERM to a child process
pub struct SignalForwarder {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SignalForwarder {
    /// Register for SIGINT and SIGTERM and start relaying them to `pid`.
    ///
    /// Registration happens before this returns. Must be called from within
    /// a tokio runtime.
    pub fn spawn(pid: u32) -> io::Result<Self> {
        let (mut interrupt, mut terminate) = acquire_signals()?;

        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let signo = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    Some(()) = interrupt.recv() => libc::SIGINT,
                    Some(()) = terminate.recv() => libc::SIGTERM,
                    else => break,
                };
                forward(pid, signo);
            }
            debug!(pid, "signal forwarder stopped");
        });

        Ok(Self { token, handle })
    }

    /// Stop relaying, wait for the task to exit and hand SIGINT and SIGTERM
    /// back to their previous dispositions
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "signal forwarder task failed");
        }
        release_signals();
    }
}

fn forward(pid: u32, signo: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };

    debug!(pid, signo, "forwarding signal to child");
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signo) };
    if rc != 0 {
        debug!(pid, signo, error = %io::Error::last_os_error(), "failed to forward signal");
    }
}
