//! Pluggable, lazily-initialized demangling capability.
//!
//! Names resolved locally from a full symbol table are still mangled; names
//! coming back from the symbolication server are not. The demangler is an
//! injected capability with an identity-function default, never a hidden
//! global: the store applies it to locally resolved names only, and a failed
//! initialization is logged and falls back to identity rather than failing
//! the resolution.

use log::warn;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex};

/// The demangling transform itself.
pub type DemangleFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Deferred constructor for a [`DemangleFn`]; run at most once, on first use.
pub type DemangleInit = Box<dyn FnOnce() -> anyhow::Result<DemangleFn> + Send>;

pub struct Demangler {
    init: Mutex<Option<DemangleInit>>,
    resolved: OnceCell<DemangleFn>,
}

impl Demangler {
    /// A demangler that leaves every name untouched.
    #[must_use]
    pub fn identity() -> Self {
        Self::with_init(Box::new(|| Ok(Arc::new(|name: &str| name.to_string()) as DemangleFn)))
    }

    /// The default capability: Rust symbol demangling via `rustc_demangle`,
    /// with the hash suffix stripped.
    #[must_use]
    pub fn rust_default() -> Self {
        Self::with_init(Box::new(|| {
            Ok(Arc::new(|name: &str| format!("{:#}", rustc_demangle::demangle(name)))
                as DemangleFn)
        }))
    }

    /// Build from a deferred initializer, e.g. one that loads an external
    /// demangling module.
    #[must_use]
    pub fn with_init(init: DemangleInit) -> Self {
        Self { init: Mutex::new(Some(init)), resolved: OnceCell::new() }
    }

    /// Apply the capability to one name, initializing it on first use.
    pub fn apply(&self, name: &str) -> String {
        let f = self.resolved.get_or_init(|| {
            let init = self.init.lock().ok().and_then(|mut slot| slot.take());
            match init.map(|init| init()) {
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    warn!("Demangler initialization failed, using identity: {e}");
                    Arc::new(|name: &str| name.to_string())
                }
                // Initializer already consumed by a racing caller that lost
                // the OnceCell race; identity is the safe answer.
                None => Arc::new(|name: &str| name.to_string()),
            }
        });
        f(name)
    }
}

impl Default for Demangler {
    fn default() -> Self {
        Self::rust_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_default_demangles() {
        let d = Demangler::rust_default();
        let out = d.apply("_ZN4core3fmt5write17h1234567890abcdefE");
        assert_eq!(out, "core::fmt::write");
    }

    #[test]
    fn test_identity_passthrough() {
        let d = Demangler::identity();
        assert_eq!(d.apply("_Zwhatever"), "_Zwhatever");
    }

    #[test]
    fn test_failed_init_falls_back_to_identity() {
        let d = Demangler::with_init(Box::new(|| anyhow::bail!("module failed to load")));
        assert_eq!(d.apply("_ZN1a1bE"), "_ZN1a1bE");
        // Initialization is attempted once; later calls stay on identity
        assert_eq!(d.apply("plain"), "plain");
    }
}
