//! Panic containment for request handlers.
//!
//! [`PanicGuard`] is the single boundary at which a handler panic is caught.
//! Anything that unwinds out of a guarded future (or a guarded response body)
//! is logged once, with its payload, source location and backtrace, and then
//! turned into a [`HandlerPanic`], which answers the call as
//! `Code::Internal`. The panic never reaches the runtime, so the connection
//! and the process survive.
//!
//! Backtraces are captured by a process-wide panic hook installed the first
//! time a guard is built. The hook only intercepts panics raised while a
//! guard is polling on the current thread; every other panic is forwarded to
//! the previously installed hook untouched.

use crate::env::Environment;
use core::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    pin::Pin,
    task::{Context, Poll},
};
use pin_project_lite::pin_project;
use std::{
    backtrace::Backtrace,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Once},
};
use tonic::Status;

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

struct PanicSite {
    location: Option<String>,
    backtrace: Backtrace,
}

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let site = PanicSite {
                location: info.location().map(ToString::to_string),
                backtrace: Backtrace::force_capture(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
        }));
    });
}

/// Runs `f`, catching any unwind and marking the thread as guarded so the
/// hook captures the panic site instead of printing it.
pub(crate) fn catch_unwind_guarded<R>(f: impl FnOnce() -> R) -> Result<R, Box<dyn Any + Send>> {
    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

/// A handler panic that was caught and logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerPanic {
    pub method: String,
    pub message: String,
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler for {} panicked: {}", self.method, self.message)
    }
}

impl std::error::Error for HandlerPanic {}

impl From<HandlerPanic> for Status {
    fn from(_: HandlerPanic) -> Self {
        // The panic payload stays in the server log.
        Status::internal("internal server error")
    }
}

/// Catches panics raised while serving a call.
#[derive(Clone, Debug)]
pub struct PanicGuard {
    env: Environment,
}

impl PanicGuard {
    pub fn new(env: Environment) -> Self {
        install_hook();
        Self { env }
    }

    pub const fn environment(&self) -> Environment {
        self.env
    }

    /// Wraps `future` so that a panic while polling it resolves to
    /// `Err(HandlerPanic)` instead of unwinding.
    pub fn guard<F>(&self, method: impl Into<Arc<str>>, future: F) -> Guarded<F> {
        Guarded {
            inner: future,
            guard: self.clone(),
            method: method.into(),
        }
    }

    /// Runs a synchronous closure under the guard.
    pub fn call<R>(&self, method: &str, f: impl FnOnce() -> R) -> Result<R, HandlerPanic> {
        catch_unwind_guarded(f).map_err(|payload| self.recover(method, payload))
    }

    /// Logs a caught panic payload and converts it into a [`HandlerPanic`].
    pub(crate) fn recover(&self, method: &str, payload: Box<dyn Any + Send>) -> HandlerPanic {
        let message = panic_message(payload.as_ref());
        let site = LAST_PANIC.with(|slot| slot.borrow_mut().take());
        let (location, backtrace) = match site {
            Some(site) => (
                site.location.unwrap_or_default(),
                site.backtrace.to_string(),
            ),
            None => (String::new(), Backtrace::force_capture().to_string()),
        };

        tracing::error!(
            env = %self.env,
            method,
            panic = %message,
            location = %location,
            backtrace = %backtrace,
            "[PANIC] ({}) {} ```{}```",
            self.env,
            message,
            method,
        );

        HandlerPanic {
            method: method.to_owned(),
            message,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

pin_project! {
    /// Future returned by [`PanicGuard::guard`].
    pub struct Guarded<F> {
        #[pin]
        inner: F,
        guard: PanicGuard,
        method: Arc<str>,
    }
}

impl<F: Future> Future for Guarded<F> {
    type Output = Result<F::Output, HandlerPanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match catch_unwind_guarded(|| this.inner.as_mut().poll(cx)) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(this.guard.recover(&**this.method, payload))),
        }
    }
}
