//! Interceptors and the per-method hook chain
//!
//! ## Execution Order
//!
//! ```text
//!   entry(FIRST) → entry(NORMAL) → entry(LAST) → original body
//!                                                     │
//!   exit(FIRST)  ← exit(NORMAL)  ← exit(LAST)  ←──────┘
//! ```
//!
//! Entry hooks run in descending priority, exit hooks in the reverse order,
//! so a measurement hook at [`Priority::LAST`] sits closest to the original
//! body and excludes the cost of every other interceptor. Equal priorities
//! keep installation order.
//!
//! Any entry hook may return [`Flow::SkipOriginal`]; the remaining entry
//! hooks still run, the original body does not, and every exit hook is
//! still invoked so measurements stay balanced. Exit hooks also run when the
//! body fails.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::warn;
use perfscope_common::{MethodId, MethodRef};

use crate::domain::{HostError, PatchError, PatchTarget, Priority};
use crate::host::Value;
use crate::workers::panic_message;

/// Decision returned by an entry hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    SkipOriginal,
}

/// Call being intercepted
pub struct CallSite<'a> {
    pub method: MethodId,
    pub target: &'a MethodRef,
    pub args: &'a [Value],
}

/// Scratch slot carried from an interceptor's entry hook to its exit hook.
#[derive(Default)]
pub struct HookState(Option<Box<dyn Any + Send>>);

impl HookState {
    pub fn put<T: Any + Send>(&mut self, value: T) {
        self.0 = Some(Box::new(value));
    }

    pub fn take<T: Any + Send>(&mut self) -> Option<T> {
        self.0.take().and_then(|boxed| boxed.downcast::<T>().ok()).map(|b| *b)
    }
}

pub type EntryHook = Arc<dyn Fn(&CallSite<'_>, &mut HookState) -> Flow + Send + Sync>;
pub type ExitHook = Arc<dyn Fn(&CallSite<'_>, &mut HookState, Result<&Value, &HostError>) + Send + Sync>;

/// Owner-tagged pair of entry and exit hooks.
#[derive(Clone)]
pub struct Interceptor {
    pub owner: Arc<str>,
    pub priority: Priority,
    pub entry: Option<EntryHook>,
    pub exit: Option<ExitHook>,
}

impl Interceptor {
    pub fn new(owner: &str, priority: Priority) -> Self {
        Self { owner: Arc::from(owner), priority, entry: None, exit: None }
    }

    #[must_use]
    pub fn on_entry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallSite<'_>, &mut HookState) -> Flow + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallSite<'_>, &mut HookState, Result<&Value, &HostError>) + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(hook));
        self
    }

    /// Re-tag the interceptor with another owner.
    #[must_use]
    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Arc::from(owner);
        self
    }

    /// True when both interceptors run the very same hook closures.
    #[must_use]
    pub fn same_hooks(&self, other: &Interceptor) -> bool {
        fn same<T: ?Sized>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>(),
                (None, None) => true,
                _ => false,
            }
        }
        same(self.entry.as_ref(), other.entry.as_ref()) && same(self.exit.as_ref(), other.exit.as_ref())
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("entry", &self.entry.is_some())
            .field("exit", &self.exit.is_some())
            .finish()
    }
}

/// Ordered, immutable set of interceptors on one method.
///
/// Installing or removing builds a new chain which the method slot swaps in
/// whole, so a call that already loaded the old chain finishes with it.
#[derive(Debug, Default, Clone)]
pub struct HookChain {
    interceptors: Vec<Interceptor>,
}

impl HookChain {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn contains_owner(&self, owner: &str) -> bool {
        self.interceptors.iter().any(|i| &*i.owner == owner)
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.interceptors.iter().map(|i| &*i.owner)
    }

    /// New chain with `interceptor` inserted after every hook of equal or
    /// higher priority.
    pub fn with(&self, target: &PatchTarget, interceptor: Interceptor) -> Result<Self, PatchError> {
        if self.contains_owner(&interceptor.owner) {
            return Err(PatchError::AlreadyPatched {
                target: target.clone(),
                owner: interceptor.owner.to_string(),
            });
        }
        let mut interceptors = self.interceptors.clone();
        let at = interceptors.partition_point(|i| i.priority >= interceptor.priority);
        interceptors.insert(at, interceptor);
        Ok(Self { interceptors })
    }

    /// New chain without any interceptor of `owner`.
    #[must_use]
    pub fn without(&self, owner: &str) -> Self {
        Self { interceptors: self.interceptors.iter().filter(|i| &*i.owner != owner).cloned().collect() }
    }

    /// Run the chain around `body`.
    pub fn run<F>(&self, method: MethodId, target: &MethodRef, args: &mut [Value], body: F) -> Result<Value, HostError>
    where
        F: FnOnce(&mut [Value]) -> Result<Value, HostError>,
    {
        if self.interceptors.is_empty() {
            return body(args);
        }

        let mut states: Vec<HookState> = self.interceptors.iter().map(|_| HookState::default()).collect();
        let mut skip = false;
        {
            let site = CallSite { method, target, args: &*args };
            for (interceptor, state) in self.interceptors.iter().zip(states.iter_mut()) {
                let Some(entry) = &interceptor.entry else { continue };
                match panic::catch_unwind(AssertUnwindSafe(|| entry(&site, state))) {
                    Ok(Flow::SkipOriginal) => skip = true,
                    Ok(Flow::Continue) => {}
                    Err(payload) => {
                        warn!(
                            "Entry hook of {} on {target} panicked: {}",
                            interceptor.owner,
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
        }

        let result = if skip { Ok(Value::Unit) } else { body(args) };

        let site = CallSite { method, target, args: &*args };
        for (interceptor, state) in self.interceptors.iter().zip(states.iter_mut()).rev() {
            let Some(exit) = &interceptor.exit else { continue };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| exit(&site, state, result.as_ref()))) {
                warn!(
                    "Exit hook of {} on {target} panicked: {}",
                    interceptor.owner,
                    panic_message(payload.as_ref())
                );
            }
        }
        result
    }
}
