//! Static security validator.
//!
//! Runs before anything is handed to the compiler. Hard violations reject the
//! script outright; warnings are advisory only. Unbounded loops cannot be
//! detected statically in general, so the loop heuristics never block a
//! script: the execution watchdog is what stops it.
//!
//! Violations are aggregated, sorted and de-duplicated, so the report depends
//! only on which constructs are present, not on the order they appear in.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lexer::{tokenize, Token, TokenKind};
use crate::permissions::{ApiCategory, PermissionSet};
use crate::policy::{
    is_api_allowed, is_explicitly_allowed, is_namespace_allowed, namespace_matches,
    required_category,
};

/// Namespace roots that are always checked against the full policy when they
/// start a qualified name. Other qualified names are only checked against the
/// deny-list, since they are usually member access on locals.
const ROOT_NAMESPACES: &[&str] = &["System", "Microsoft", "Mono"];

/// Keywords that start construct rules. Their verbatim forms (`@unsafe`) are
/// plain identifiers and never match.
const RULE_KEYWORDS: &[&str] = &[
    "unsafe", "stackalloc", "fixed", "delegate", "extern", "void", "byte", "sbyte", "char",
    "short", "ushort", "int", "uint", "long", "ulong", "float", "double", "decimal", "bool",
];

/// Using aliases may name other aliases; deeper chains are not followed.
const MAX_ALIAS_DEPTH: usize = 8;

/// Limits applied before and during scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorLimits {
    /// Maximum source size in bytes.
    pub max_source_size: usize,
    /// Maximum bracket nesting depth.
    pub max_nesting_depth: usize,
    /// Branch count above which a complexity warning is emitted.
    pub max_branch_complexity: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_source_size: 256 * 1024,
            max_nesting_depth: 256,
            max_branch_complexity: 64,
        }
    }
}

/// 1-based line/column of a construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub col: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

impl From<&Token<'_>> for SourceLocation {
    fn from(token: &Token<'_>) -> Self {
        Self {
            line: token.line,
            col: token.col,
        }
    }
}

/// Classification of a hard violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Source exceeds the size limit.
    SourceTooLarge,
    /// Source is empty or whitespace.
    EmptySource,
    /// Bracket nesting exceeds the depth limit.
    NestingTooDeep,
    /// A referenced namespace is denied by the namespace lists.
    NamespaceDenied,
    /// A construct or namespace needs an API category that is not granted.
    CategoryNotGranted,
    /// An always-dangerous construct (unsafe code, interop, code generation, process spawning).
    DangerousConstruct,
    /// External assembly loading without the permission for it.
    ExternalAssembly,
}

/// A hard validation failure. Blocks execution; never downgraded to a warning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Script the violation belongs to.
    pub script_id: String,
    /// Classification.
    pub kind: ViolationKind,
    /// The offending construct as written (namespace, keyword or call).
    pub violating_construct: String,
    /// Human-readable explanation.
    pub reason: String,
    /// Earliest location of the construct, when known.
    pub source_location: Option<SourceLocation>,
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source_location {
            Some(loc) => write!(f, "{} at {}: {}", self.violating_construct, loc, self.reason),
            None => write!(f, "{}: {}", self.violating_construct, self.reason),
        }
    }
}

/// Classification of an advisory warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum WarningKind {
    /// `while(true)` / `for(;;)` / `do..while(true)` without a reachable exit.
    UnboundedLoop,
    /// `#pragma warning disable`.
    SuppressedWarnings,
    /// `goto` control flow.
    Goto,
    /// Catch-all handler that can swallow cancellation.
    CatchAll,
    /// Branch count above the configured threshold.
    BranchComplexity,
}

/// An advisory finding. Logged for auditing, never blocks compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityWarning {
    /// Script the warning belongs to.
    pub script_id: String,
    /// Classification.
    pub kind: WarningKind,
    /// The construct as written.
    pub construct: String,
    /// Human-readable explanation.
    pub reason: String,
    /// Location of the construct, when known.
    pub source_location: Option<SourceLocation>,
}

/// Outcome of validating one source text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Hard violations, sorted and de-duplicated.
    pub violations: Vec<SecurityViolation>,
    /// Advisory warnings, sorted by location.
    pub warnings: Vec<SecurityWarning>,
    /// Namespaces the source references, for the compiler collaborator.
    pub referenced_namespaces: BTreeSet<String>,
}

impl ValidationReport {
    /// Whether the script must not be compiled.
    pub fn is_rejected(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// What a dangerous construct needs before it is permitted.
#[derive(Debug, Clone, Copy)]
enum Requirement {
    /// Only the `Unsafe` category unlocks it.
    Unsafe,
    /// Permitted when the category is granted or the namespace is explicitly
    /// allowed, and the namespace is not denied.
    Explicit {
        category: Option<ApiCategory>,
        namespace: &'static str,
    },
    /// Permitted when the category is granted.
    Category(ApiCategory),
    /// Permitted when the set may load external assemblies.
    ExternalAssemblies,
}

struct ConstructRule {
    pattern: &'static [&'static str],
    /// The match must not follow a `.` (it would be a member of something else).
    standalone: bool,
    not_followed_by: Option<&'static str>,
    requirement: Requirement,
    reason: &'static str,
}

const fn rule(
    pattern: &'static [&'static str],
    requirement: Requirement,
    reason: &'static str,
) -> ConstructRule {
    ConstructRule {
        pattern,
        standalone: false,
        not_followed_by: None,
        requirement,
        reason,
    }
}

const fn standalone(
    pattern: &'static [&'static str],
    requirement: Requirement,
    reason: &'static str,
) -> ConstructRule {
    ConstructRule {
        pattern,
        standalone: true,
        not_followed_by: None,
        requirement,
        reason,
    }
}

const INTEROP: Requirement = Requirement::Explicit {
    category: Some(ApiCategory::Unsafe),
    namespace: "System.Runtime.InteropServices",
};
const CODEGEN: Requirement = Requirement::Explicit {
    category: Some(ApiCategory::Reflection),
    namespace: "System.Reflection.Emit",
};
const PROCESS: Requirement = Requirement::Explicit {
    category: None,
    namespace: "System.Diagnostics.Process",
};

const POINTER: &str = "pointer type";

static RULES: &[ConstructRule] = &[
    // unsafe code
    rule(&["unsafe"], Requirement::Unsafe, "unsafe code context"),
    rule(&["stackalloc"], Requirement::Unsafe, "stack allocation of unmanaged memory"),
    rule(&["fixed", "("], Requirement::Unsafe, "pinned pointer"),
    rule(&["->"], Requirement::Unsafe, "pointer member access"),
    rule(&["delegate", "*"], Requirement::Unsafe, "function pointer"),
    rule(&["void", "*"], Requirement::Unsafe, POINTER),
    rule(&["byte", "*"], Requirement::Unsafe, POINTER),
    rule(&["sbyte", "*"], Requirement::Unsafe, POINTER),
    rule(&["char", "*"], Requirement::Unsafe, POINTER),
    rule(&["short", "*"], Requirement::Unsafe, POINTER),
    rule(&["ushort", "*"], Requirement::Unsafe, POINTER),
    rule(&["int", "*"], Requirement::Unsafe, POINTER),
    rule(&["uint", "*"], Requirement::Unsafe, POINTER),
    rule(&["long", "*"], Requirement::Unsafe, POINTER),
    rule(&["ulong", "*"], Requirement::Unsafe, POINTER),
    rule(&["float", "*"], Requirement::Unsafe, POINTER),
    rule(&["double", "*"], Requirement::Unsafe, POINTER),
    rule(&["decimal", "*"], Requirement::Unsafe, POINTER),
    rule(&["bool", "*"], Requirement::Unsafe, POINTER),
    rule(&["nint", "*"], Requirement::Unsafe, POINTER),
    rule(&["nuint", "*"], Requirement::Unsafe, POINTER),
    // foreign function interop
    rule(&["DllImport"], INTEROP, "native library import"),
    rule(&["LibraryImport"], INTEROP, "native library import"),
    rule(&["UnmanagedCallersOnly"], INTEROP, "native callback export"),
    ConstructRule {
        pattern: &["extern"],
        standalone: false,
        not_followed_by: Some("alias"),
        requirement: INTEROP,
        reason: "extern method declaration",
    },
    rule(&["Marshal", "."], INTEROP, "unmanaged memory marshalling"),
    rule(&["NativeLibrary", "."], INTEROP, "native library loading"),
    // dynamic code generation
    rule(&["DynamicMethod"], CODEGEN, "dynamic code generation"),
    rule(&["ILGenerator"], CODEGEN, "dynamic code generation"),
    rule(&["AssemblyBuilder"], CODEGEN, "dynamic code generation"),
    rule(&["TypeBuilder"], CODEGEN, "dynamic code generation"),
    rule(&["OpCodes", "."], CODEGEN, "dynamic code generation"),
    rule(&["CSharpScript", "."], CODEGEN, "runtime script compilation"),
    rule(&["CSharpCompilation", "."], CODEGEN, "runtime script compilation"),
    // process spawning
    rule(&["Process", ".", "Start"], PROCESS, "process spawning"),
    rule(&["ProcessStartInfo"], PROCESS, "process spawning"),
    // external assemblies
    rule(&["Assembly", ".", "Load"], Requirement::ExternalAssemblies, "external assembly loading"),
    rule(&["Assembly", ".", "LoadFrom"], Requirement::ExternalAssemblies, "external assembly loading"),
    rule(&["Assembly", ".", "LoadFile"], Requirement::ExternalAssemblies, "external assembly loading"),
    rule(&["Assembly", ".", "UnsafeLoadFrom"], Requirement::ExternalAssemblies, "external assembly loading"),
    rule(&["AssemblyLoadContext"], Requirement::ExternalAssemblies, "external assembly loading"),
    // reflective reach to ungated APIs
    rule(&["GetMethod", "("], Requirement::Category(ApiCategory::Reflection), "reflective member lookup"),
    rule(&["GetMethods", "("], Requirement::Category(ApiCategory::Reflection), "reflective member lookup"),
    rule(&["GetField", "("], Requirement::Category(ApiCategory::Reflection), "reflective member lookup"),
    rule(&["GetFields", "("], Requirement::Category(ApiCategory::Reflection), "reflective member lookup"),
    rule(&["InvokeMember", "("], Requirement::Category(ApiCategory::Reflection), "reflective invocation"),
    rule(&["Activator", "."], Requirement::Category(ApiCategory::Reflection), "reflective instantiation"),
    rule(&["Type", ".", "GetType"], Requirement::Category(ApiCategory::Reflection), "reflective type lookup"),
    // file system types reachable through implicit usings
    standalone(&["File", "."], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["Directory", "."], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["FileStream"], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["FileInfo"], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["DirectoryInfo"], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["StreamReader"], Requirement::Category(ApiCategory::FileIO), "file system access"),
    standalone(&["StreamWriter"], Requirement::Category(ApiCategory::FileIO), "file system access"),
    // network
    standalone(&["HttpClient"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["WebClient"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["WebRequest"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["Socket"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["TcpClient"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["UdpClient"], Requirement::Category(ApiCategory::Network), "network access"),
    standalone(&["Dns", "."], Requirement::Category(ApiCategory::Network), "network access"),
    // threading
    standalone(&["Thread", "("], Requirement::Category(ApiCategory::Threading), "thread creation"),
    standalone(&["Thread", "."], Requirement::Category(ApiCategory::Threading), "thread control"),
    standalone(&["ThreadPool", "."], Requirement::Category(ApiCategory::Threading), "thread pool access"),
    standalone(&["Parallel", "."], Requirement::Category(ApiCategory::Threading), "parallel execution"),
    standalone(&["Task", ".", "Run"], Requirement::Category(ApiCategory::Threading), "background task"),
    standalone(&["Task", ".", "Factory"], Requirement::Category(ApiCategory::Threading), "background task"),
];

/// Validate `source` against `permissions`.
///
/// Pure and deterministic: identical inputs always produce identical reports.
pub fn validate_source(
    source: &str,
    permissions: &PermissionSet,
    limits: &ValidatorLimits,
) -> ValidationReport {
    let mut scan = Scan::new(permissions);

    if source.len() > limits.max_source_size {
        scan.violation(
            ViolationKind::SourceTooLarge,
            "source",
            format!(
                "source exceeds maximum size of {} bytes (got {})",
                limits.max_source_size,
                source.len()
            ),
            None,
        );
        return scan.finish();
    }

    if source.trim().is_empty() {
        scan.violation(ViolationKind::EmptySource, "source", "source is empty".into(), None);
        return scan.finish();
    }

    let tokens = tokenize(source);

    // Checked before any structural walk so deep input cannot blow the stack.
    let depth = nesting_depth(&tokens);
    if depth > limits.max_nesting_depth {
        scan.violation(
            ViolationKind::NestingTooDeep,
            "source",
            format!(
                "nesting depth {depth} exceeds maximum {}",
                limits.max_nesting_depth
            ),
            None,
        );
        return scan.finish();
    }

    scan.check_escapes(&tokens);
    scan.check_namespaces(&tokens);
    scan.check_constructs(&tokens);
    scan.check_heuristics(&tokens, limits.max_branch_complexity);
    scan.finish()
}

fn nesting_depth(tokens: &[Token<'_>]) -> usize {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Punct) {
        match token.text {
            "{" | "[" | "(" => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            "}" | "]" | ")" => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max_depth
}

fn text_at<'a>(tokens: &[Token<'a>], i: usize) -> Option<&'a str> {
    tokens.get(i).map(|t| t.text)
}

fn seq(tokens: &[Token<'_>], i: usize, pattern: &[&str]) -> bool {
    pattern
        .iter()
        .enumerate()
        .all(|(k, p)| text_at(tokens, i + k) == Some(*p))
}

fn is_ident(tokens: &[Token<'_>], i: usize) -> bool {
    tokens.get(i).is_some_and(|t| t.kind == TokenKind::Ident)
}

/// Index of the bracket closing the one at `open`.
fn matching_close(tokens: &[Token<'_>], open: usize) -> Option<usize> {
    let (open_text, close_text) = match text_at(tokens, open)? {
        "(" => ("(", ")"),
        "{" => ("{", "}"),
        "[" => ("[", "]"),
        _ => return None,
    };
    let mut depth = 0usize;
    for (j, token) in tokens.iter().enumerate().skip(open) {
        if token.kind != TokenKind::Punct {
            continue;
        }
        if token.text == open_text {
            depth += 1;
        } else if token.text == close_text {
            depth -= 1;
            if depth == 0 {
                return Some(j);
            }
        }
    }
    None
}

/// End index (inclusive) of the statement or block starting at `start`.
fn statement_end(tokens: &[Token<'_>], start: usize) -> Option<usize> {
    if text_at(tokens, start)? == "{" {
        return matching_close(tokens, start);
    }
    let mut depth = 0usize;
    for (j, token) in tokens.iter().enumerate().skip(start) {
        match token.text {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth = depth.saturating_sub(1),
            ";" if depth == 0 => return Some(j),
            _ => {}
        }
    }
    None
}

/// Expand a leading using alias in `name`, following alias chains.
fn resolve_alias(aliases: &HashMap<String, String>, name: &str) -> String {
    let mut resolved = name.to_string();
    for _ in 0..MAX_ALIAS_DEPTH {
        let (root, rest) = match resolved.split_once('.') {
            Some((root, rest)) => (root, Some(rest)),
            None => (resolved.as_str(), None),
        };
        let Some(target) = aliases.get(root) else {
            break;
        };
        // `using System = System;` and friends resolve to themselves.
        if target == root {
            break;
        }
        resolved = match rest {
            Some(rest) => format!("{target}.{rest}"),
            None => target.clone(),
        };
    }
    resolved
}

/// Read a dotted name starting at `i`. Returns the name and the index after it.
fn dotted_name(tokens: &[Token<'_>], mut i: usize) -> Option<(String, usize)> {
    if seq(tokens, i, &["global", "::"]) {
        i += 2;
    }
    if !is_ident(tokens, i) {
        return None;
    }
    let mut name = tokens[i].text.to_string();
    i += 1;
    // `Alias::Name` qualifies through a using alias.
    if text_at(tokens, i) == Some("::") && is_ident(tokens, i + 1) {
        name.push('.');
        name.push_str(tokens[i + 1].text);
        i += 2;
    }
    while text_at(tokens, i) == Some(".") && is_ident(tokens, i + 1) {
        name.push('.');
        name.push_str(tokens[i + 1].text);
        i += 2;
    }
    Some((name, i))
}

struct Scan<'p> {
    permissions: &'p PermissionSet,
    violations: Vec<SecurityViolation>,
    warnings: Vec<SecurityWarning>,
    referenced: BTreeSet<String>,
}

impl<'p> Scan<'p> {
    fn new(permissions: &'p PermissionSet) -> Self {
        Self {
            permissions,
            violations: Vec::new(),
            warnings: Vec::new(),
            referenced: BTreeSet::new(),
        }
    }

    fn violation(
        &mut self,
        kind: ViolationKind,
        construct: &str,
        reason: String,
        location: Option<SourceLocation>,
    ) {
        self.violations.push(SecurityViolation {
            script_id: self.permissions.script_id().to_string(),
            kind,
            violating_construct: construct.to_string(),
            reason,
            source_location: location,
        });
    }

    fn warning(
        &mut self,
        kind: WarningKind,
        construct: &str,
        reason: &str,
        location: Option<SourceLocation>,
    ) {
        self.warnings.push(SecurityWarning {
            script_id: self.permissions.script_id().to_string(),
            kind,
            construct: construct.to_string(),
            reason: reason.to_string(),
            source_location: location,
        });
    }

    fn finish(mut self) -> ValidationReport {
        self.violations.sort_by(|a, b| {
            (&a.violating_construct, &a.reason, a.kind, a.source_location).cmp(&(
                &b.violating_construct,
                &b.reason,
                b.kind,
                b.source_location,
            ))
        });
        self.violations.dedup_by(|later, first| {
            later.violating_construct == first.violating_construct && later.reason == first.reason
        });
        self.warnings.sort_by(|a, b| {
            (a.source_location, a.kind, &a.construct).cmp(&(b.source_location, b.kind, &b.construct))
        });
        self.warnings.dedup();
        ValidationReport {
            violations: self.violations,
            warnings: self.warnings,
            referenced_namespaces: self.referenced,
        }
    }

    /// Check a namespace against the lists and, if allowed, its category.
    fn check_namespace(&mut self, name: &str, full_policy: bool, location: SourceLocation) {
        let denied = if full_policy {
            !is_namespace_allowed(self.permissions, name)
        } else {
            self.permissions
                .denied_namespaces()
                .iter()
                .any(|entry| namespace_matches(entry, name))
        };
        if denied {
            self.violation(
                ViolationKind::NamespaceDenied,
                name,
                format!("namespace '{name}' is not permitted for this script"),
                Some(location),
            );
            return;
        }
        if let Some(category) = required_category(name) {
            if !is_api_allowed(self.permissions, category) {
                self.violation(
                    ViolationKind::CategoryNotGranted,
                    name,
                    format!("namespace '{name}' requires api category {category}"),
                    Some(location),
                );
            }
        }
    }

    fn check_namespaces(&mut self, tokens: &[Token<'_>]) {
        let mut consumed = HashSet::new();
        let mut directives = Vec::new();
        let mut aliases = HashMap::new();

        // using directives
        let mut i = 0;
        while i < tokens.len() {
            let at_using = tokens[i].text == "using"
                && !tokens[i].verbatim
                && (i == 0
                    || tokens[i - 1].kind == TokenKind::Directive
                    || matches!(text_at(tokens, i - 1), Some(";" | "}" | "global" | "{")));
            if !at_using {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            if matches!(text_at(tokens, j), Some("(" | "var" | "await")) {
                // using statement / declaration, not a directive
                i += 1;
                continue;
            }
            if text_at(tokens, j) == Some("static") {
                j += 1;
            }
            let mut alias = None;
            if is_ident(tokens, j) && text_at(tokens, j + 1) == Some("=") {
                alias = Some(tokens[j].text);
                j += 2;
            }
            if let Some((name, end)) = dotted_name(tokens, j) {
                consumed.extend(i..end);
                if let Some(alias) = alias {
                    aliases.insert(alias.to_string(), name.clone());
                }
                directives.push((name, SourceLocation::from(&tokens[i])));
                i = end;
            } else {
                i += 1;
            }
        }
        for (name, location) in directives {
            let resolved = resolve_alias(&aliases, &name);
            self.referenced.insert(resolved.clone());
            if resolved != name {
                self.check_namespace(&name, false, location);
            }
            self.check_namespace(&resolved, true, location);
        }

        // namespace declarations: code inside `namespace System` resolves
        // `IO.File` to `System.IO.File` without ever naming the root.
        for (i, token) in tokens.iter().enumerate() {
            if token.text != "namespace" || token.verbatim {
                continue;
            }
            if let Some((name, _)) = dotted_name(tokens, i + 1) {
                let root = name.split('.').next().unwrap_or_default();
                if ROOT_NAMESPACES.contains(&root) {
                    self.violation(
                        ViolationKind::NamespaceDenied,
                        &name,
                        format!("declaring code inside reserved namespace '{name}' is not permitted"),
                        Some(SourceLocation::from(token)),
                    );
                }
            }
        }

        // qualified names in code
        let mut i = 0;
        while i < tokens.len() {
            let chain_start = !consumed.contains(&i)
                && is_ident(tokens, i)
                && !matches!(
                    i.checked_sub(1).and_then(|p| text_at(tokens, p)),
                    Some("." | "::" | "?." | "namespace")
                );
            if !chain_start {
                i += 1;
                continue;
            }
            match dotted_name(tokens, i) {
                Some((name, end)) if name.contains('.') => {
                    let location = SourceLocation::from(&tokens[i]);
                    let resolved = resolve_alias(&aliases, &name);
                    if resolved != name {
                        self.check_namespace(&name, false, location);
                    }
                    let root = resolved.split('.').next().unwrap_or_default();
                    let rooted = ROOT_NAMESPACES.contains(&root);
                    if rooted {
                        self.referenced.insert(resolved.clone());
                    }
                    self.check_namespace(&resolved, rooted, location);
                    i = end;
                }
                Some((_, end)) => i = end.max(i + 1),
                None => i += 1,
            }
        }
    }

    /// `\uXXXX` escapes spell identifiers the scanner cannot compare by text.
    fn check_escapes(&mut self, tokens: &[Token<'_>]) {
        for token in tokens {
            if token.kind == TokenKind::Punct && token.text == "\\" {
                self.violation(
                    ViolationKind::DangerousConstruct,
                    "\\",
                    "unicode escape in identifier".into(),
                    Some(SourceLocation::from(token)),
                );
            }
        }
    }

    fn check_constructs(&mut self, tokens: &[Token<'_>]) {
        for i in 0..tokens.len() {
            if tokens[i].kind == TokenKind::Literal || tokens[i].kind == TokenKind::Directive {
                continue;
            }
            for rule in RULES {
                if !seq(tokens, i, rule.pattern) {
                    continue;
                }
                if tokens[i].verbatim && RULE_KEYWORDS.contains(&rule.pattern[0]) {
                    continue;
                }
                if rule.standalone && i > 0 && text_at(tokens, i - 1) == Some(".") {
                    continue;
                }
                if let Some(next) = rule.not_followed_by {
                    if text_at(tokens, i + rule.pattern.len()) == Some(next) {
                        continue;
                    }
                }
                self.apply_rule(rule, &tokens[i]);
            }
        }
    }

    fn apply_rule(&mut self, rule: &ConstructRule, token: &Token<'_>) {
        let permissions = self.permissions;
        let construct = rule
            .pattern
            .iter()
            .filter(|p| **p != "(")
            .copied()
            .collect::<Vec<_>>()
            .join("")
            .trim_end_matches('.')
            .to_string();
        let location = Some(SourceLocation::from(token));

        match rule.requirement {
            Requirement::Unsafe => {
                if !is_api_allowed(permissions, ApiCategory::Unsafe) {
                    self.violation(
                        ViolationKind::DangerousConstruct,
                        &construct,
                        format!("{} requires api category {}", rule.reason, ApiCategory::Unsafe),
                        location,
                    );
                }
            }
            Requirement::Explicit {
                category,
                namespace,
            } => {
                let denied = permissions
                    .denied_namespaces()
                    .iter()
                    .any(|entry| namespace_matches(entry, namespace));
                let granted = category.is_some_and(|c| is_api_allowed(permissions, c))
                    || is_explicitly_allowed(permissions, namespace);
                if denied || !granted {
                    let unlock = match category {
                        Some(c) => format!("api category {c} or an explicit '{namespace}' namespace grant"),
                        None => format!("an explicit '{namespace}' namespace grant"),
                    };
                    self.violation(
                        ViolationKind::DangerousConstruct,
                        &construct,
                        format!("{} requires {unlock}", rule.reason),
                        location,
                    );
                }
            }
            Requirement::Category(category) => {
                if !is_api_allowed(permissions, category) {
                    self.violation(
                        ViolationKind::CategoryNotGranted,
                        &construct,
                        format!("{} requires api category {category}", rule.reason),
                        location,
                    );
                }
            }
            Requirement::ExternalAssemblies => {
                if !permissions.can_load_external_assemblies() {
                    self.violation(
                        ViolationKind::ExternalAssembly,
                        &construct,
                        format!("{} is not permitted for this script", rule.reason),
                        location,
                    );
                }
            }
        }
    }

    fn check_heuristics(&mut self, tokens: &[Token<'_>], max_branch_complexity: usize) {
        let mut branches = 0usize;

        for (i, token) in tokens.iter().enumerate() {
            let location = Some(SourceLocation::from(token));

            if token.kind == TokenKind::Directive {
                let words: Vec<&str> = token.text.trim_start_matches('#').split_whitespace().collect();
                if words.first() == Some(&"pragma")
                    && words.get(1) == Some(&"warning")
                    && words.get(2) == Some(&"disable")
                {
                    self.warning(
                        WarningKind::SuppressedWarnings,
                        token.text,
                        "compiler warnings suppressed",
                        location,
                    );
                }
                continue;
            }
            if token.kind == TokenKind::Literal || token.verbatim {
                continue;
            }

            match token.text {
                "if" | "case" | "while" | "for" | "foreach" | "catch" | "&&" | "||" | "?" => {
                    branches += 1
                }
                _ => {}
            }

            if token.text == "goto" {
                self.warning(WarningKind::Goto, "goto", "goto-based control flow", location);
            }

            if token.text == "catch"
                && (seq(tokens, i + 1, &["{"])
                    || seq(tokens, i + 1, &["(", "Exception"])
                    || seq(tokens, i + 1, &["(", "System", ".", "Exception"])
                    || seq(tokens, i + 1, &["(", "OperationCanceledException"]))
            {
                self.warning(
                    WarningKind::CatchAll,
                    "catch",
                    "catch-all handler may swallow cancellation",
                    location,
                );
            }

            if let Some(construct) = unbounded_loop(tokens, i) {
                self.warning(
                    WarningKind::UnboundedLoop,
                    construct,
                    "unconditional loop with no reachable exit",
                    location,
                );
            }
        }

        if branches > max_branch_complexity {
            self.warning(
                WarningKind::BranchComplexity,
                "source",
                "branching complexity exceeds threshold",
                None,
            );
        }
    }
}

/// If an unconditional loop starts at `i` and its body has no exit, name it.
fn unbounded_loop(tokens: &[Token<'_>], i: usize) -> Option<&'static str> {
    let (construct, body_start) = if seq(tokens, i, &["while", "(", "true", ")"]) {
        // `} while (true);` is the tail of a do-loop, handled at the `do`.
        if i > 0 && text_at(tokens, i - 1) == Some("}") && text_at(tokens, i + 4) == Some(";") {
            return None;
        }
        ("while(true)", i + 4)
    } else if seq(tokens, i, &["for", "(", ";", ";", ")"]) {
        ("for(;;)", i + 5)
    } else if text_at(tokens, i) == Some("do") {
        let end = statement_end(tokens, i + 1)?;
        if !seq(tokens, end + 1, &["while", "(", "true", ")"]) {
            return None;
        }
        return (!has_exit(tokens, i + 1, end)).then_some("do..while(true)");
    } else {
        return None;
    };

    if text_at(tokens, body_start) == Some(";") {
        return Some(construct);
    }
    let end = statement_end(tokens, body_start)?;
    (!has_exit(tokens, body_start, end)).then_some(construct)
}

/// Whether the token range `[start, end]` contains a reachable loop exit.
///
/// `return`, `throw` and `goto` leave from any depth; `break` only counts when
/// it is not inside a nested loop or switch.
fn has_exit(tokens: &[Token<'_>], start: usize, end: usize) -> bool {
    let mut nested_until: Vec<usize> = Vec::new();
    let mut j = if text_at(tokens, start) == Some("{") {
        start + 1
    } else {
        start
    };
    while j <= end {
        while nested_until.last().is_some_and(|e| j > *e) {
            nested_until.pop();
        }
        match tokens[j].text {
            "return" | "throw" | "goto" => return true,
            "yield" if text_at(tokens, j + 1) == Some("break") => return true,
            "break" if nested_until.is_empty() => return true,
            "while" | "for" | "foreach" | "switch" => {
                let header_end = if text_at(tokens, j + 1) == Some("(") {
                    matching_close(tokens, j + 1)
                } else {
                    None
                };
                if let Some(h) = header_end {
                    if let Some(body_end) = statement_end(tokens, h + 1) {
                        nested_until.push(body_end);
                    }
                }
            }
            "do" => {
                if let Some(body_end) = statement_end(tokens, j + 1) {
                    nested_until.push(body_end);
                }
            }
            _ => {}
        }
        j += 1;
    }
    false
}
