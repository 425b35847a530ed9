#![forbid(unsafe_code)]

//! Call-through override machinery for named pre-submission checks.
//!
//! A downstream project that embeds an upstream validation framework often
//! needs to disable, rewrite, or filter individual checks without forking the
//! file that defines them. This crate provides the two mechanisms that make
//! that possible:
//!
//! - **Override registry**: [`install_override`] locates a named check in a
//!   [`Scope`], wraps it so the replacement receives the original as its
//!   explicit first argument, and rebinds the name to the wrapper. A check
//!   that has disappeared from the upstream set is reported and replaced with
//!   a no-op instead of aborting the run, because upstream check sets drift
//!   between framework revisions.
//! - **Scoped method override**: [`override_method`] installs the same kind
//!   of wrapper on a single named slot and returns a guard that restores the
//!   captured original on every exit path, including panic unwind. A missing
//!   slot here is a broken override definition and fails fast.
//!
//! All registration happens synchronously during a single startup phase,
//! before any check executes. The machinery never intercepts errors raised by
//! the callables themselves.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Leading substring that marks a table entry as a check by naming
/// convention. Used only by [`first_check_name`].
pub const CHECK_NAME_PREFIX: &str = "Check";

// ---------------------------------------------------------------------------
// CheckFn / Scope — the callable and the container it lives in
// ---------------------------------------------------------------------------

/// A check: a named callable that receives the framework's input value and
/// returns a sequence of findings.
///
/// Both the input type `I` and the finding type `F` are opaque to this crate.
/// The input is passed `&mut` because upstream checks are permitted to adjust
/// the input object they are handed (extending skip lists, for example).
pub type CheckFn<I, F> = Arc<dyn Fn(&mut I) -> Vec<F> + Send + Sync>;

/// A name→callable container whose bindings can be read and rewritten in
/// place.
///
/// Two families of scope exist. Mapping-like scopes (such as [`CheckTable`])
/// can bind any name, including names they have never seen. Fixed-slot scopes
/// expose a closed set of named slots, like an object whose methods are
/// rebindable, and are expected to ignore [`rebind`](Scope::rebind) calls for
/// names they do not carry.
///
/// A typed scope cannot hold a non-callable value, so the "present but not
/// callable" lookup outcome collapses into `None`.
pub trait Scope<I, F> {
    /// Returns a handle to the callable currently bound to `name`, or `None`
    /// if the scope has no such binding.
    fn lookup(&self, name: &str) -> Option<CheckFn<I, F>>;

    /// Rebinds `name` to `check`. Fixed-slot scopes ignore names outside
    /// their slot set.
    fn rebind(&mut self, name: &str, check: CheckFn<I, F>);
}

// ---------------------------------------------------------------------------
// CheckTable — the concrete mapping scope
// ---------------------------------------------------------------------------

/// Insertion-ordered name→check table.
///
/// Iteration order is the order in which names were first registered; a
/// rebind keeps the original position. [`first_check_name`] depends on this,
/// which is why the table is not a sorted map.
pub struct CheckTable<I, F> {
    entries: IndexMap<String, CheckFn<I, F>>,
}

impl<I, F> CheckTable<I, F> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Binds `name` to `check`, replacing any existing binding in place.
    pub fn register(&mut self, name: impl Into<String>, check: CheckFn<I, F>) {
        self.entries.insert(name.into(), check);
    }

    /// Convenience form of [`register`](Self::register) that wraps a plain
    /// closure or function.
    pub fn register_fn<C>(&mut self, name: impl Into<String>, check: C)
    where
        C: Fn(&mut I) -> Vec<F> + Send + Sync + 'static,
        I: 'static,
        F: 'static,
    {
        self.register(name, Arc::new(check));
    }

    pub fn get(&self, name: &str) -> Option<&CheckFn<I, F>> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }
}

impl<I, F> Default for CheckTable<I, F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, F> fmt::Debug for CheckTable<I, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckTable")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<I, F> Scope<I, F> for CheckTable<I, F> {
    fn lookup(&self, name: &str) -> Option<CheckFn<I, F>> {
        self.entries.get(name).cloned()
    }

    fn rebind(&mut self, name: &str, check: CheckFn<I, F>) {
        self.entries.insert(name.to_string(), check);
    }
}

// ---------------------------------------------------------------------------
// OverrideError — typed error contract for the fail-fast paths
// ---------------------------------------------------------------------------

/// Errors raised at override-setup time.
///
/// These are the programmer-error tier: a broken override definition that
/// must be fixed in code. Expected upstream drift (a check renamed or removed
/// between framework revisions) is handled by [`install_override`] without an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    /// The slot named by a scoped override does not exist on the target.
    #[error("method `{name}` to override not found in scope")]
    MethodNotFound { name: String },

    /// No entry matching the check naming convention exists in the table.
    #[error("no `Check*`-named entry found in scope")]
    NoConformingCheck,
}

// ---------------------------------------------------------------------------
// install_override — permanent call-through override
// ---------------------------------------------------------------------------

/// A check that always produces an empty finding sequence.
pub fn noop_check<I, F>() -> CheckFn<I, F>
where
    I: 'static,
    F: 'static,
{
    Arc::new(|_| Vec::new())
}

/// Replaces the check bound to `name` with a wrapper that delegates to
/// `replacement`, passing the previously bound callable as the explicit first
/// argument. Returns the installed wrapper.
///
/// If the scope has no binding for `name`, a warning is emitted and a no-op
/// check producing zero findings is bound instead (mapping scopes install it;
/// fixed-slot scopes ignore the rebind and the no-op is only returned). The
/// overall validation run must survive an override whose upstream counterpart
/// has been renamed or removed.
///
/// Overriding the same name again captures the previous wrapper as the new
/// original, so repeated overrides chain rather than reset. Errors raised by
/// `replacement` or the original during invocation propagate to the caller
/// unchanged.
pub fn install_override<S, I, F, R>(scope: &mut S, name: &str, replacement: R) -> CheckFn<I, F>
where
    S: Scope<I, F> + ?Sized,
    R: Fn(&CheckFn<I, F>, &mut I) -> Vec<F> + Send + Sync + 'static,
    I: 'static,
    F: 'static,
{
    let Some(original) = scope.lookup(name) else {
        warn!(check = %name, "check to override not found; substituting a no-op");
        let noop = noop_check();
        scope.rebind(name, Arc::clone(&noop));
        return noop;
    };

    let wrapper: CheckFn<I, F> = Arc::new(move |input| replacement(&original, input));
    scope.rebind(name, Arc::clone(&wrapper));
    wrapper
}

/// Returns the name of the first entry in `table` whose name starts with
/// [`CHECK_NAME_PREFIX`], scanning in insertion order.
///
/// The result tracks however the table was populated: if the upstream
/// framework changes its declaration order, the answer moves with it. Errors
/// if no conforming entry exists.
pub fn first_check_name<I, F>(table: &CheckTable<I, F>) -> Result<&str, OverrideError> {
    table
        .names()
        .find(|name| name.starts_with(CHECK_NAME_PREFIX))
        .ok_or(OverrideError::NoConformingCheck)
}

// ---------------------------------------------------------------------------
// MethodOverrideGuard — scoped override with guaranteed restore
// ---------------------------------------------------------------------------

/// Scoped-acquisition resource returned by [`override_method`].
///
/// While the guard is alive the scope resolves `name` to the override; when
/// it is dropped (on normal exit, early return, or panic unwind) the captured
/// original is rebound. Restoration uses the captured handle, not a
/// re-lookup, so a rebind performed mid-block is overwritten on restore.
///
/// At most one guard per (scope, name) pair may be active; nesting the same
/// pair restores the wrong original.
pub struct MethodOverrideGuard<'a, S, I, F>
where
    S: Scope<I, F> + ?Sized,
{
    name: String,
    original: Option<CheckFn<I, F>>,
    scope: &'a mut S,
}

impl<S, I, F> MethodOverrideGuard<'_, S, I, F>
where
    S: Scope<I, F> + ?Sized,
{
    /// Name of the overridden slot.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S, I, F> Deref for MethodOverrideGuard<'_, S, I, F>
where
    S: Scope<I, F> + ?Sized,
{
    type Target = S;

    fn deref(&self) -> &S {
        self.scope
    }
}

impl<S, I, F> DerefMut for MethodOverrideGuard<'_, S, I, F>
where
    S: Scope<I, F> + ?Sized,
{
    fn deref_mut(&mut self) -> &mut S {
        self.scope
    }
}

impl<S, I, F> Drop for MethodOverrideGuard<'_, S, I, F>
where
    S: Scope<I, F> + ?Sized,
{
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            self.scope.rebind(&self.name, original);
        }
    }
}

/// Temporarily overrides the slot `name` on `scope`, returning a guard that
/// restores the captured original when dropped.
///
/// Unlike [`install_override`], a missing slot is a fatal setup error: a
/// scoped override always targets a collaborator the caller controls, so an
/// absent slot means the override definition itself is broken.
pub fn override_method<'a, S, I, F, R>(
    scope: &'a mut S,
    name: &str,
    replacement: R,
) -> Result<MethodOverrideGuard<'a, S, I, F>, OverrideError>
where
    S: Scope<I, F> + ?Sized,
    R: Fn(&CheckFn<I, F>, &mut I) -> Vec<F> + Send + Sync + 'static,
    I: 'static,
    F: 'static,
{
    let Some(original) = scope.lookup(name) else {
        return Err(OverrideError::MethodNotFound {
            name: name.to_string(),
        });
    };

    let captured = Arc::clone(&original);
    scope.rebind(name, Arc::new(move |input| replacement(&captured, input)));

    Ok(MethodOverrideGuard {
        name: name.to_string(),
        original: Some(original),
        scope,
    })
}

/// Runs `block` with the slot `name` temporarily overridden, restoring the
/// original on every exit path and returning the block's value.
///
/// A panic inside `block` propagates to the caller after restoration runs.
pub fn with_method_override<S, I, F, R, B, T>(
    scope: &mut S,
    name: &str,
    replacement: R,
    block: B,
) -> Result<T, OverrideError>
where
    S: Scope<I, F> + ?Sized,
    R: Fn(&CheckFn<I, F>, &mut I) -> Vec<F> + Send + Sync + 'static,
    B: FnOnce(&mut S) -> T,
    I: 'static,
    F: 'static,
{
    let mut guard = override_method(scope, name, replacement)?;
    Ok(block(&mut *guard))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Change {
        log: Vec<String>,
    }

    fn recording_check(tag: &'static str) -> CheckFn<Change, String> {
        Arc::new(move |change: &mut Change| {
            change.log.push(tag.to_string());
            vec![format!("{tag}-finding")]
        })
    }

    fn table_with(names: &[&'static str]) -> CheckTable<Change, String> {
        let mut table = CheckTable::new();
        for name in names {
            table.register(*name, recording_check(name));
        }
        table
    }

    fn run(table: &CheckTable<Change, String>, name: &str, change: &mut Change) -> Vec<String> {
        let check = table.get(name).map(Arc::clone).expect("check bound");
        check(change)
    }

    // -- install_override --

    #[test]
    fn override_delegates_to_replacement_with_original() {
        let mut table = table_with(&["CheckOwners"]);
        install_override(&mut table, "CheckOwners", |original, change| {
            let mut findings = original(change);
            findings.push("wrapped".to_string());
            findings
        });

        let mut change = Change::default();
        let findings = run(&table, "CheckOwners", &mut change);
        assert_eq!(findings, vec!["CheckOwners-finding", "wrapped"]);
        assert_eq!(change.log, vec!["CheckOwners"]);
    }

    #[test]
    fn override_can_drop_original_entirely() {
        let mut table = table_with(&["CheckOwners", "CheckLicense"]);
        install_override(&mut table, "CheckOwners", |_, _| Vec::new());

        let mut change = Change::default();
        assert!(run(&table, "CheckOwners", &mut change).is_empty());
        // the suppressed original never ran
        assert!(change.log.is_empty());
    }

    #[test]
    fn sibling_entries_are_untouched() {
        let mut table = table_with(&["CheckOwners", "CheckLicense"]);
        let license_before = table.get("CheckLicense").map(Arc::clone).expect("bound");

        install_override(&mut table, "CheckOwners", |_, _| Vec::new());

        let license_after = table.get("CheckLicense").map(Arc::clone).expect("bound");
        assert!(Arc::ptr_eq(&license_before, &license_after));
    }

    #[test]
    fn missing_check_installs_noop_in_mapping_scope() {
        let mut table: CheckTable<Change, String> = CheckTable::new();
        let returned = install_override(&mut table, "CheckMissing", |original, change| {
            original(change)
        });

        let mut change = Change::default();
        assert!(run(&table, "CheckMissing", &mut change).is_empty());
        let installed = table.get("CheckMissing").map(Arc::clone).expect("bound");
        assert!(Arc::ptr_eq(&returned, &installed));
    }

    #[test]
    fn repeated_overrides_chain_through_prior_wrapper() {
        let mut table = table_with(&["CheckOwners"]);
        install_override(&mut table, "CheckOwners", |original, change| {
            let mut findings = original(change);
            findings.push("first".to_string());
            findings
        });
        install_override(&mut table, "CheckOwners", |original, change| {
            let mut findings = original(change);
            findings.push("second".to_string());
            findings
        });

        let mut change = Change::default();
        let findings = run(&table, "CheckOwners", &mut change);
        assert_eq!(findings, vec!["CheckOwners-finding", "first", "second"]);
    }

    #[test]
    fn rebind_keeps_table_position() {
        let mut table = table_with(&["SetupHook", "CheckOwners", "CheckLicense"]);
        install_override(&mut table, "CheckLicense", |_, _| Vec::new());

        let names: Vec<&str> = table.names().collect();
        assert_eq!(names, vec!["SetupHook", "CheckOwners", "CheckLicense"]);
        assert_eq!(table.len(), 3);
    }

    // -- first_check_name --

    #[test]
    fn first_check_name_honors_insertion_order() {
        let table = table_with(&["SetupHook", "CheckOwners", "CheckLicense"]);
        assert_eq!(first_check_name(&table), Ok("CheckOwners"));
    }

    #[test]
    fn first_check_name_errors_when_no_entry_conforms() {
        let table = table_with(&["SetupHook", "Teardown"]);
        assert_eq!(
            first_check_name(&table),
            Err(OverrideError::NoConformingCheck)
        );
        let empty: CheckTable<Change, String> = CheckTable::new();
        assert_eq!(
            first_check_name(&empty),
            Err(OverrideError::NoConformingCheck)
        );
    }

    // -- scoped override --

    #[test]
    fn override_method_restores_on_drop() {
        let mut table = table_with(&["CheckOwners"]);
        let before = table.get("CheckOwners").map(Arc::clone).expect("bound");

        {
            let guard = override_method(&mut table, "CheckOwners", |_, _| {
                vec!["temporary".to_string()]
            })
            .expect("slot exists");

            let mut change = Change::default();
            let check = guard.lookup("CheckOwners").expect("bound");
            assert_eq!(check(&mut change), vec!["temporary"]);
        }

        let after = table.get("CheckOwners").map(Arc::clone).expect("bound");
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn override_method_fails_fast_on_missing_slot() {
        let mut table: CheckTable<Change, String> = CheckTable::new();
        let result = override_method(&mut table, "CheckMissing", |_, _| Vec::new());
        assert!(matches!(
            result,
            Err(OverrideError::MethodNotFound { ref name }) if name == "CheckMissing"
        ));
        drop(result);
        // the hard path must not install anything
        assert!(table.is_empty());
    }

    #[test]
    fn with_method_override_returns_block_value() {
        let mut table = table_with(&["CheckOwners"]);
        let value = with_method_override(
            &mut table,
            "CheckOwners",
            |_, _| vec!["temporary".to_string()],
            |table| {
                let mut change = Change::default();
                run(table, "CheckOwners", &mut change)
            },
        )
        .expect("slot exists");
        assert_eq!(value, vec!["temporary"]);
    }

    #[test]
    fn mid_block_rebind_is_overwritten_by_restore() {
        let mut table = table_with(&["CheckOwners"]);
        let before = table.get("CheckOwners").map(Arc::clone).expect("bound");

        with_method_override(
            &mut table,
            "CheckOwners",
            |_, _| Vec::new(),
            |table| table.rebind("CheckOwners", recording_check("interloper")),
        )
        .expect("slot exists");

        let after = table.get("CheckOwners").map(Arc::clone).expect("bound");
        assert!(Arc::ptr_eq(&before, &after));
    }
}
