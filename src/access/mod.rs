//! Per-method permission gate.
//!
//! Every remote method carries a set of scopes: the roles that may call it
//! plus its own name. Deployments install allow and deny rules per scope; a
//! call is authorised iff no deny rule matches and at least one allow rule
//! matches any of the method's scopes. The gate reads no mutable state after
//! installation, so evaluation needs no locking.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::core::types::CallerId;

/// A predicate rule: `(caller, method, params) -> bool`.
pub type Predicate = dyn Fn(&CallerId, &str, &Value) -> bool + Send + Sync;

/// A scope a rule can be installed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Full administrative access.
    Admin,
    /// Job administration (pause, cancel, restart, remove).
    Manager,
    /// Job submission (save, rerun).
    Creator,
    /// Work execution (getWork, progress, log, done, fail).
    Worker,
    /// A single method by wire name.
    Method(String),
}

impl Scope {
    /// Scope for a method's own name.
    pub fn method(name: impl Into<String>) -> Self {
        Scope::Method(name.into())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Admin => f.write_str("admin"),
            Scope::Manager => f.write_str("manager"),
            Scope::Creator => f.write_str("creator"),
            Scope::Worker => f.write_str("worker"),
            Scope::Method(name) => f.write_str(name),
        }
    }
}

/// One allow or deny rule.
#[derive(Clone)]
pub enum AccessRule {
    /// Matches callers in the set.
    Identities(HashSet<CallerId>),
    /// Matches when the predicate returns true.
    Predicate(Arc<Predicate>),
}

impl AccessRule {
    /// Rule matching exactly the given callers.
    pub fn identities<I>(ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<CallerId>,
    {
        Self::Identities(ids.into_iter().map(Into::into).collect())
    }

    /// Rule matching a single caller.
    pub fn identity(id: impl Into<CallerId>) -> Self {
        Self::identities([id.into()])
    }

    /// Rule evaluated as a predicate over the call.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CallerId, &str, &Value) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Rule matching every caller.
    pub fn anyone() -> Self {
        Self::predicate(|_, _, _| true)
    }

    fn matches(&self, caller: &CallerId, method: &str, params: &Value) -> bool {
        match self {
            AccessRule::Identities(ids) => ids.contains(caller),
            AccessRule::Predicate(f) => f(caller, method, params),
        }
    }
}

impl fmt::Debug for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessRule::Identities(ids) => f.debug_tuple("Identities").field(ids).finish(),
            AccessRule::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// The installed rule lists, evaluated per call.
#[derive(Debug, Default)]
pub struct AccessGate {
    allow: HashMap<Scope, Vec<AccessRule>>,
    deny: HashMap<Scope, Vec<AccessRule>>,
}

impl AccessGate {
    /// A gate with no rules: every external call is denied.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate that admits every caller to every method.
    pub fn permissive() -> Self {
        let mut gate = Self::new();
        gate.allow(Scope::Admin, AccessRule::anyone());
        gate
    }

    /// Install an allow rule under a scope.
    pub fn allow(&mut self, scope: Scope, rule: AccessRule) -> &mut Self {
        self.allow.entry(scope).or_default().push(rule);
        self
    }

    /// Install a deny rule under a scope.
    pub fn deny(&mut self, scope: Scope, rule: AccessRule) -> &mut Self {
        self.deny.entry(scope).or_default().push(rule);
        self
    }

    /// Evaluate the gate for one call.
    ///
    /// `scopes` is the method's scope set (its roles plus its own name).
    /// Deny rules short-circuit to rejection; otherwise any allow match on
    /// any scope admits.
    pub fn authorize(
        &self,
        caller: &CallerId,
        method: &str,
        scopes: &[Scope],
        params: &Value,
    ) -> bool {
        for scope in scopes {
            if let Some(rules) = self.deny.get(scope) {
                if rules.iter().any(|r| r.matches(caller, method, params)) {
                    return false;
                }
            }
        }
        for scope in scopes {
            if let Some(rules) = self.allow.get(scope) {
                if rules.iter().any(|r| r.matches(caller, method, params)) {
                    return true;
                }
            }
        }
        false
    }
}
