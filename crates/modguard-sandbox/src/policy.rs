//! Namespace and API policy evaluation.
//!
//! Pure functions over a [`PermissionSet`]; no state, no locks, safe to call
//! from any number of threads.

use crate::permissions::{ApiCategory, PermissionSet};

/// Namespace roots owned by each gated API category.
///
/// Referencing one of these namespaces requires the category, whatever the
/// namespace lists say.
pub const CATEGORY_NAMESPACES: &[(ApiCategory, &str)] = &[
    (ApiCategory::FileIO, "System.IO"),
    (ApiCategory::Network, "System.Net"),
    (ApiCategory::Reflection, "System.Reflection"),
    (ApiCategory::Threading, "System.Threading"),
    (ApiCategory::Serialization, "System.Text.Json"),
    (ApiCategory::Serialization, "System.Xml"),
    (ApiCategory::Serialization, "System.Runtime.Serialization"),
    (ApiCategory::Unsafe, "System.Runtime.CompilerServices.Unsafe"),
    (ApiCategory::Unsafe, "System.Runtime.InteropServices"),
];

/// Whether `category` is granted. `Core` always is.
pub fn is_api_allowed(permissions: &PermissionSet, category: ApiCategory) -> bool {
    category == ApiCategory::Core || permissions.allowed_apis().contains(category)
}

/// Resolve a namespace against the allow/deny lists.
///
/// 1. Any denied entry matching or prefixing `name` denies.
/// 2. Otherwise an empty allow-list, or an allowed entry matching or
///    prefixing `name`, allows.
/// 3. Otherwise deny.
///
/// Empty or whitespace names are always denied.
pub fn is_namespace_allowed(permissions: &PermissionSet, name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    if permissions
        .denied_namespaces()
        .iter()
        .any(|entry| namespace_matches(entry, name))
    {
        return false;
    }
    permissions.allowed_namespaces().is_empty() || is_explicitly_allowed(permissions, name)
}

/// Whether a non-empty allow-list entry names `name` (exactly or as a prefix).
///
/// Unlike [`is_namespace_allowed`], an empty allow-list grants nothing here.
pub fn is_explicitly_allowed(permissions: &PermissionSet, name: &str) -> bool {
    permissions
        .allowed_namespaces()
        .iter()
        .any(|entry| namespace_matches(entry, name.trim()))
}

/// Case-insensitive, dot-segment prefix match: `System` matches `System`
/// and `System.IO` but not `SystemX`.
///
/// Case folding is Unicode lowercase per segment, so non-ASCII identifiers
/// match regardless of case too.
pub fn namespace_matches(entry: &str, name: &str) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    let mut names = name.split('.');
    entry
        .split('.')
        .all(|segment| names.next().is_some_and(|n| segment_eq(segment, n)))
}

fn segment_eq(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// The category a namespace falls under, if it is gated.
pub fn required_category(name: &str) -> Option<ApiCategory> {
    CATEGORY_NAMESPACES
        .iter()
        .filter(|(_, root)| namespace_matches(root, name))
        .max_by_key(|(_, root)| root.len())
        .map(|(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionLevel;

    fn with_lists(allow: &[&str], deny: &[&str]) -> PermissionSet {
        let builder = allow
            .iter()
            .fold(PermissionSet::builder(), |b, ns| b.allow_namespace(*ns));
        deny.iter()
            .fold(builder, |b, ns| b.deny_namespace(*ns))
            .with_script_id("policy-test")
            .with_level(PermissionLevel::Standard)
            .build()
            .unwrap()
    }

    #[test]
    fn core_always_allowed() {
        let set = with_lists(&[], &[]);
        assert!(is_api_allowed(&set, ApiCategory::Core));
        assert!(!is_api_allowed(&set, ApiCategory::FileIO));
    }

    #[test]
    fn granted_categories_allowed() {
        let set = PermissionSet::standard("s").unwrap();
        assert!(is_api_allowed(&set, ApiCategory::GameStateRead));
        assert!(!is_api_allowed(&set, ApiCategory::Network));
    }

    #[test]
    fn deny_takes_precedence_over_allow() {
        let set = with_lists(&["System"], &["System.IO"]);
        assert!(!is_namespace_allowed(&set, "System.IO.File"));
        assert!(!is_namespace_allowed(&set, "System.IO"));
        assert!(is_namespace_allowed(&set, "System.Collections"));
        assert!(is_namespace_allowed(&set, "System"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let set = with_lists(&["System"], &["System.IO"]);
        assert!(!is_namespace_allowed(&set, "system.io"));
        assert!(!is_namespace_allowed(&set, "SYSTEM.IO.FILE"));
        assert!(is_namespace_allowed(&set, "system.collections.generic"));
    }

    #[test]
    fn matching_folds_non_ascii_case() {
        assert!(namespace_matches("Spiel.Ökonomie", "spiel.ökonomie.Handel"));
        assert!(namespace_matches("ΛΟΓΙΚΗ", "λογικη"));
        assert!(!namespace_matches("Spiel.Ökonomie", "Spiel.Ökonomiee"));
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        assert!(namespace_matches("System", "System.IO"));
        assert!(!namespace_matches("System", "SystemX"));
        assert!(!namespace_matches("System.IO", "System.IOExtensions"));
        assert!(!namespace_matches("System.IO", "System"));
    }

    #[test]
    fn empty_allow_list_is_permissive() {
        let set = with_lists(&[], &["System.Net"]);
        assert!(is_namespace_allowed(&set, "Game.Combat"));
        assert!(is_namespace_allowed(&set, "System.Linq"));
        assert!(!is_namespace_allowed(&set, "System.Net.Http"));
    }

    #[test]
    fn non_empty_allow_list_is_exclusive() {
        let set = with_lists(&["Game"], &[]);
        assert!(is_namespace_allowed(&set, "Game.Combat"));
        assert!(!is_namespace_allowed(&set, "System.Linq"));
    }

    #[test]
    fn blank_names_fail_closed() {
        let set = with_lists(&[], &[]);
        assert!(!is_namespace_allowed(&set, ""));
        assert!(!is_namespace_allowed(&set, "   "));
    }

    #[test]
    fn explicit_allow_ignores_permissive_default() {
        let set = with_lists(&[], &[]);
        assert!(!is_explicitly_allowed(&set, "System.Diagnostics.Process"));
        let set = with_lists(&["System.Diagnostics.Process"], &[]);
        assert!(is_explicitly_allowed(&set, "System.Diagnostics.Process"));
    }

    #[test]
    fn required_category_picks_longest_root() {
        assert_eq!(required_category("System.IO.File"), Some(ApiCategory::FileIO));
        assert_eq!(
            required_category("System.Runtime.InteropServices.Marshal"),
            Some(ApiCategory::Unsafe)
        );
        assert_eq!(
            required_category("System.Runtime.Serialization.Json"),
            Some(ApiCategory::Serialization)
        );
        assert_eq!(required_category("System.Collections.Generic"), None);
        assert_eq!(required_category("Game.State"), None);
    }

    #[test]
    fn evaluator_is_shareable_across_threads() {
        let set = std::sync::Arc::new(with_lists(&["System"], &["System.IO"]));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let set = set.clone();
                std::thread::spawn(move || {
                    (0..1000).all(|_| {
                        !is_namespace_allowed(&set, "System.IO.File")
                            && is_namespace_allowed(&set, "System.Linq")
                    })
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
