#![forbid(unsafe_code)]

//! The downstream override set for the embedded pre-submission framework.
//!
//! The upstream framework ships a table of named top-level checks plus a
//! bundle of canned checks hanging off the review input. This crate decides
//! which of those this project keeps, which it silences, and which it
//! reshapes:
//!
//! - checks tied to upstream-only workflow (OWNERS files, tree status, bug
//!   tracker fields, string screenshot tests) are suppressed outright;
//! - the formatting check keeps running, but its findings are rewritten to
//!   name this project's format command instead of the upstream one;
//! - the include-guard check sees file paths through the downstream
//!   directory prefix, applied only for the duration of that one check;
//! - the JSON parse check gains an allowlist entry for config files that are
//!   intentionally not strict JSON.
//!
//! [`apply_overrides`] is called once at tool startup, before any check
//! executes. Everything here is policy; the override mechanics live in
//! `checkgate-overrides`.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use checkgate_overrides::{
    first_check_name, install_override, with_method_override, CheckFn, CheckTable, OverrideError,
    Scope,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Directory prefix under which this project's tree is vendored into the
/// upstream checkout.
pub const DOWNSTREAM_PATH_PREFIX: &str = "overlay/";

/// Skip patterns appended to every review input before canned checks run.
const DEFAULT_FILES_TO_SKIP: &[&str] = &[r"win_build_output[\\/].*"];

/// Upstream format commands rewritten in formatting findings to the command
/// this project actually uses.
const FORMAT_COMMAND_REWRITES: &[(&str, &str)] = &[
    ("git cl format", "npm run format --"),
    ("gn format", "npm run format --"),
];

/// Allowlist pattern appended for config files that are intentionally not
/// strict JSON.
const INVALID_JSON_PATTERN_APPEND: &str = r"tsconfig\.json$";

pub const CHECK_LICENSE: &str = "CheckLicense";
pub const CHECK_OWNERS: &str = "CheckOwners";
pub const CHECK_OWNERS_FORMAT: &str = "CheckOwnersFormat";
pub const CHECK_CHANGE_HAS_BUG_FIELD: &str = "CheckChangeHasBugField";
pub const CHECK_TREE_IS_OPEN: &str = "CheckTreeIsOpen";
pub const CHECK_PATCH_FORMATTED: &str = "CheckPatchFormatted";
pub const CHECK_SECURITY_OWNERS: &str = "CheckSecurityOwners";
pub const CHECK_STRINGS: &str = "CheckStrings";
pub const CHECK_PYDEPS_NEEDS_UPDATING: &str = "CheckPydepsNeedsUpdating";
pub const CHECK_FOR_INCLUDE_GUARDS: &str = "CheckForIncludeGuards";
pub const CHECK_PARSE_ERRORS: &str = "CheckParseErrors";
pub const AFFECTED_SOURCE_FILES: &str = "AffectedSourceFiles";

/// Top-level checks silenced for this project.
pub const SUPPRESSED_TABLE_CHECKS: &[&str] = &[
    CHECK_SECURITY_OWNERS,
    CHECK_STRINGS,
    CHECK_PYDEPS_NEEDS_UPDATING,
];

/// Canned checks silenced for this project.
pub const SUPPRESSED_CANNED_CHECKS: &[&str] = &[
    CHECK_LICENSE,
    CHECK_OWNERS,
    CHECK_OWNERS_FORMAT,
    CHECK_CHANGE_HAS_BUG_FIELD,
    CHECK_TREE_IS_OPEN,
];

// ---------------------------------------------------------------------------
// Finding — what a check reports
// ---------------------------------------------------------------------------

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Notice,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single diagnostic reported by a check: a message, a severity, and the
/// paths it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub message: String,
    pub severity: Severity,
    pub items: Vec<String>,
}

impl Finding {
    pub fn new(severity: Severity, message: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            message: message.into(),
            severity,
            items,
        }
    }

    pub fn warning(message: impl Into<String>, items: Vec<String>) -> Self {
        Self::new(Severity::Warning, message, items)
    }

    pub fn error(message: impl Into<String>, items: Vec<String>) -> Self {
        Self::new(Severity::Error, message, items)
    }
}

/// One file touched by the change under review. Content-derived facts are
/// precomputed by the embedding tool before checks run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedFile {
    pub path: String,
    pub is_source: bool,
    pub has_license_banner: bool,
    pub needs_format: bool,
}

impl AffectedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_source: true,
            has_license_banner: true,
            needs_format: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ReviewInput — the object handed to every check
// ---------------------------------------------------------------------------

/// The review input: the change under review plus the collaborators checks
/// reach through.
///
/// The source-file lister is a rebindable slot; `ReviewInput` implements
/// [`Scope`] over its slots so the lister can be overridden for the duration
/// of a single check. The slot receives the input object itself as its
/// argument.
pub struct ReviewInput {
    pub files: Vec<AffectedFile>,
    pub change_description: String,
    pub tree_open: bool,
    pub files_to_skip: Vec<String>,
    pub invalid_json_allowlist: Vec<String>,
    pub canned: CannedChecks,
    affected_source_files: CheckFn<ReviewInput, AffectedFile>,
}

impl ReviewInput {
    pub fn new(files: Vec<AffectedFile>) -> Self {
        Self {
            files,
            change_description: String::new(),
            tree_open: true,
            files_to_skip: Vec::new(),
            invalid_json_allowlist: Vec::new(),
            canned: CannedChecks::upstream_defaults(),
            affected_source_files: Arc::new(default_affected_source_files),
        }
    }

    /// Lists the source files of the change through the (possibly
    /// overridden) lister slot.
    pub fn affected_source_files(&mut self) -> Vec<AffectedFile> {
        let lister = Arc::clone(&self.affected_source_files);
        lister(self)
    }

    /// Runs the named canned check. Unknown names produce no findings.
    pub fn run_canned(&mut self, name: &str) -> Vec<Finding> {
        match self.canned.lookup(name) {
            Some(check) => check(self),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for ReviewInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewInput")
            .field("files", &self.files)
            .field("change_description", &self.change_description)
            .field("tree_open", &self.tree_open)
            .field("files_to_skip", &self.files_to_skip)
            .field("invalid_json_allowlist", &self.invalid_json_allowlist)
            .finish_non_exhaustive()
    }
}

impl Scope<ReviewInput, AffectedFile> for ReviewInput {
    fn lookup(&self, name: &str) -> Option<CheckFn<ReviewInput, AffectedFile>> {
        match name {
            AFFECTED_SOURCE_FILES => Some(Arc::clone(&self.affected_source_files)),
            _ => None,
        }
    }

    fn rebind(&mut self, name: &str, check: CheckFn<ReviewInput, AffectedFile>) {
        if name == AFFECTED_SOURCE_FILES {
            self.affected_source_files = check;
        }
    }
}

fn default_affected_source_files(input: &mut ReviewInput) -> Vec<AffectedFile> {
    input
        .files
        .iter()
        .filter(|file| file.is_source)
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// CannedChecks — the upstream-bundled check set
// ---------------------------------------------------------------------------

/// The fixed set of framework-bundled checks reachable from the review
/// input. A fixed-slot [`Scope`]: rebinds for names outside the set are
/// ignored.
pub struct CannedChecks {
    check_license: CheckFn<ReviewInput, Finding>,
    check_owners: CheckFn<ReviewInput, Finding>,
    check_owners_format: CheckFn<ReviewInput, Finding>,
    check_change_has_bug_field: CheckFn<ReviewInput, Finding>,
    check_tree_is_open: CheckFn<ReviewInput, Finding>,
    check_patch_formatted: CheckFn<ReviewInput, Finding>,
}

impl CannedChecks {
    /// The bundled implementations as the upstream framework registers them.
    pub fn upstream_defaults() -> Self {
        Self {
            check_license: Arc::new(bundled_check_license),
            check_owners: Arc::new(bundled_check_owners),
            check_owners_format: Arc::new(bundled_check_owners_format),
            check_change_has_bug_field: Arc::new(bundled_check_change_has_bug_field),
            check_tree_is_open: Arc::new(bundled_check_tree_is_open),
            check_patch_formatted: Arc::new(bundled_check_patch_formatted),
        }
    }
}

impl Default for CannedChecks {
    fn default() -> Self {
        Self::upstream_defaults()
    }
}

impl fmt::Debug for CannedChecks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CannedChecks").finish_non_exhaustive()
    }
}

impl Scope<ReviewInput, Finding> for CannedChecks {
    fn lookup(&self, name: &str) -> Option<CheckFn<ReviewInput, Finding>> {
        match name {
            CHECK_LICENSE => Some(Arc::clone(&self.check_license)),
            CHECK_OWNERS => Some(Arc::clone(&self.check_owners)),
            CHECK_OWNERS_FORMAT => Some(Arc::clone(&self.check_owners_format)),
            CHECK_CHANGE_HAS_BUG_FIELD => Some(Arc::clone(&self.check_change_has_bug_field)),
            CHECK_TREE_IS_OPEN => Some(Arc::clone(&self.check_tree_is_open)),
            CHECK_PATCH_FORMATTED => Some(Arc::clone(&self.check_patch_formatted)),
            _ => None,
        }
    }

    fn rebind(&mut self, name: &str, check: CheckFn<ReviewInput, Finding>) {
        match name {
            CHECK_LICENSE => self.check_license = check,
            CHECK_OWNERS => self.check_owners = check,
            CHECK_OWNERS_FORMAT => self.check_owners_format = check,
            CHECK_CHANGE_HAS_BUG_FIELD => self.check_change_has_bug_field = check,
            CHECK_TREE_IS_OPEN => self.check_tree_is_open = check,
            CHECK_PATCH_FORMATTED => self.check_patch_formatted = check,
            _ => {}
        }
    }
}

fn bundled_check_license(input: &mut ReviewInput) -> Vec<Finding> {
    let missing: Vec<String> = input
        .files
        .iter()
        .filter(|file| file.is_source && !file.has_license_banner)
        .map(|file| file.path.clone())
        .collect();
    if missing.is_empty() {
        Vec::new()
    } else {
        vec![Finding::error(
            "License must be present in source file banners.",
            missing,
        )]
    }
}

fn bundled_check_owners(input: &mut ReviewInput) -> Vec<Finding> {
    if input.files.is_empty() {
        Vec::new()
    } else {
        vec![Finding::warning(
            "Missing OWNERS reviewer approval for the affected paths.",
            input.files.iter().map(|file| file.path.clone()).collect(),
        )]
    }
}

fn bundled_check_owners_format(input: &mut ReviewInput) -> Vec<Finding> {
    let owners_files: Vec<String> = input
        .files
        .iter()
        .filter(|file| file.path == "OWNERS" || file.path.ends_with("/OWNERS"))
        .map(|file| file.path.clone())
        .collect();
    if owners_files.is_empty() {
        Vec::new()
    } else {
        vec![Finding::warning(
            "OWNERS file syntax could not be validated.",
            owners_files,
        )]
    }
}

fn bundled_check_change_has_bug_field(input: &mut ReviewInput) -> Vec<Finding> {
    let has_bug_line = input
        .change_description
        .lines()
        .any(|line| line.starts_with("Bug:"));
    if has_bug_line {
        Vec::new()
    } else {
        vec![Finding::warning(
            "Changelist description is missing a Bug: line.",
            Vec::new(),
        )]
    }
}

fn bundled_check_tree_is_open(input: &mut ReviewInput) -> Vec<Finding> {
    if input.tree_open {
        Vec::new()
    } else {
        vec![Finding::error("The tree is closed.", Vec::new())]
    }
}

fn bundled_check_patch_formatted(input: &mut ReviewInput) -> Vec<Finding> {
    let unformatted: Vec<String> = input
        .files
        .iter()
        .filter(|file| file.needs_format)
        .map(|file| file.path.clone())
        .collect();
    if unformatted.is_empty() {
        Vec::new()
    } else {
        vec![Finding::warning(
            "Proposed changes are not formatted; run `git cl format` (`gn format` for GN files).",
            unformatted,
        )]
    }
}

// ---------------------------------------------------------------------------
// Override set
// ---------------------------------------------------------------------------

/// Installs every override this project applies to the upstream check table.
/// Called once at tool startup, before any check executes.
///
/// The first conforming check in the table is additionally wrapped so that
/// canned-check customization runs before any real check does its work.
/// Errors if the table carries no conforming check at all.
pub fn apply_overrides(table: &mut CheckTable<ReviewInput, Finding>) -> Result<(), OverrideError> {
    let first = first_check_name(table)?.to_string();
    install_override(table, &first, |original, input| {
        customize_canned_checks(input);
        original(input)
    });

    for name in SUPPRESSED_TABLE_CHECKS {
        install_override(table, name, |_, _| Vec::new());
    }

    install_override(table, CHECK_FOR_INCLUDE_GUARDS, override_include_guards);
    install_override(table, CHECK_PARSE_ERRORS, override_parse_errors);

    Ok(())
}

/// Adjusts the review input and its canned checks for this project: extends
/// the skip patterns, silences the canned checks this project has no use
/// for, and rewrites formatting findings to name this project's format
/// command.
pub fn customize_canned_checks(input: &mut ReviewInput) {
    for pattern in DEFAULT_FILES_TO_SKIP {
        if !input.files_to_skip.iter().any(|existing| existing == pattern) {
            input.files_to_skip.push((*pattern).to_string());
        }
    }

    for name in SUPPRESSED_CANNED_CHECKS {
        install_override(&mut input.canned, name, |_, _| Vec::new());
    }

    install_override(&mut input.canned, CHECK_PATCH_FORMATTED, |original, input| {
        let mut findings = original(input);
        for finding in &mut findings {
            for &(upstream, downstream) in FORMAT_COMMAND_REWRITES {
                finding.message = finding.message.replace(upstream, downstream);
            }
        }
        findings
    });
}

/// Runs the upstream include-guard check with the source-file lister
/// temporarily overridden: skipped files are dropped and every remaining
/// path is presented under the downstream prefix. The lister is restored
/// before this returns.
fn override_include_guards(
    original: &CheckFn<ReviewInput, Finding>,
    input: &mut ReviewInput,
) -> Vec<Finding> {
    let original = Arc::clone(original);
    match with_method_override(
        input,
        AFFECTED_SOURCE_FILES,
        |lister, input| {
            let skip = compile_skip_patterns(&input.files_to_skip);
            lister(input)
                .into_iter()
                .filter(|file| !skip.iter().any(|pattern| pattern.is_match(&file.path)))
                .map(|mut file| {
                    file.path = format!("{DOWNSTREAM_PATH_PREFIX}{}", file.path);
                    file
                })
                .collect()
        },
        |input| original(input),
    ) {
        Ok(findings) => findings,
        // the lister slot always exists on ReviewInput
        Err(_) => original(input),
    }
}

/// Extends the invalid-JSON allowlist before the upstream parse check runs.
fn override_parse_errors(
    original: &CheckFn<ReviewInput, Finding>,
    input: &mut ReviewInput,
) -> Vec<Finding> {
    input
        .invalid_json_allowlist
        .push(INVALID_JSON_PATTERN_APPEND.to_string());
    original(input)
}

fn compile_skip_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(compiled) => Some(compiled),
            Err(error) => {
                debug!(pattern = %pattern, %error, "ignoring unparseable skip pattern");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
