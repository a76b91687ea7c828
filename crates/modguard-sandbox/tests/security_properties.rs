//! Permission model, policy and validator properties, exercised through the
//! public API only.

use std::time::Duration;

use modguard_sandbox::{
    is_api_allowed, is_namespace_allowed, validate_source, ApiCategory, EscalationError,
    PermissionLevel, PermissionSet, Preset, ValidatorLimits, ViolationKind,
};

fn at_level(level: PermissionLevel) -> modguard_sandbox::PermissionSetBuilder {
    PermissionSet::builder()
        .with_script_id("props")
        .with_level(level)
}

#[test]
fn elevated_categories_need_elevated_level() {
    let elevated = [
        ApiCategory::FileIO,
        ApiCategory::Network,
        ApiCategory::Reflection,
        ApiCategory::Threading,
    ];
    for level in PermissionLevel::ALL {
        for category in elevated {
            let result = at_level(level).allow_api(category).build();
            if level < PermissionLevel::Elevated {
                match result {
                    Err(EscalationError::InsufficientLevel {
                        category: c,
                        required,
                        ..
                    }) => {
                        assert_eq!(c, category);
                        assert_eq!(required, PermissionLevel::Elevated);
                    }
                    other => panic!("{category} at {level} should not build: {other:?}"),
                }
            } else {
                assert!(result.is_ok(), "{category} at {level} should build");
            }
        }
    }
}

#[test]
fn unsafe_needs_unrestricted() {
    for level in PermissionLevel::ALL {
        let result = at_level(level).allow_api(ApiCategory::Unsafe).build();
        assert_eq!(
            result.is_ok(),
            level == PermissionLevel::Unrestricted,
            "Unsafe at {level}"
        );
    }
}

#[test]
fn namespace_precedence_and_case() {
    let set = at_level(PermissionLevel::Standard)
        .allow_namespace("System")
        .deny_namespace("System.IO")
        .build()
        .unwrap();
    assert!(!is_namespace_allowed(&set, "System.IO.File"));
    assert!(is_namespace_allowed(&set, "System.Collections"));
    assert!(!is_namespace_allowed(&set, "system.io"));
    assert!(!is_namespace_allowed(&set, "   "));
}

#[test]
fn empty_allow_list_is_permissive() {
    let set = at_level(PermissionLevel::Restricted)
        .deny_namespace("Game.Internal")
        .build()
        .unwrap();
    assert!(is_namespace_allowed(&set, "Game.World"));
    assert!(is_namespace_allowed(&set, "Anything.At.All"));
    assert!(!is_namespace_allowed(&set, "Game.Internal.Saves"));
}

#[test]
fn core_is_always_allowed() {
    let set = at_level(PermissionLevel::None).build().unwrap();
    assert!(is_api_allowed(&set, ApiCategory::Core));
    assert!(!is_api_allowed(&set, ApiCategory::Logging));
}

#[test]
fn standard_preset_round_trip() {
    let a = Preset::Standard.build("weather").unwrap();
    let b = Preset::Standard.build("weather").unwrap();
    assert_eq!(a, b);
    for denied in [
        "System.IO",
        "System.Net",
        "System.Reflection",
        "System.Threading",
    ] {
        assert!(!is_namespace_allowed(&a, denied), "{denied}");
        assert!(!is_namespace_allowed(&b, denied), "{denied}");
    }
}

#[test]
fn preset_budgets_increase_monotonically() {
    let presets = [
        Preset::Restricted,
        Preset::Standard,
        Preset::Elevated,
        Preset::Unrestricted,
    ]
    .map(|p| p.build("budget").unwrap());
    for pair in presets.windows(2) {
        assert!(pair[0].max_execution_time() < pair[1].max_execution_time());
        assert!(pair[0].max_memory_bytes() < pair[1].max_memory_bytes());
        assert!(pair[0].level() < pair[1].level());
    }
}

#[test]
fn out_of_bounds_budget_is_refused() {
    let err = at_level(PermissionLevel::Standard)
        .with_timeout(Duration::from_secs(24 * 60 * 60))
        .build()
        .unwrap_err();
    assert!(matches!(err, EscalationError::TimeoutOutOfBounds { .. }));
}

#[test]
fn validation_is_idempotent_and_order_independent() {
    let set = Preset::Standard.build("idem").unwrap();
    let limits = ValidatorLimits::default();
    let forward = "using System.IO;\nusing System.Net;\nunsafe class A { }";
    let backward = "using System.Net;\nusing System.IO;\nunsafe class A { }";

    let first = validate_source(forward, &set, &limits);
    let second = validate_source(forward, &set, &limits);
    assert_eq!(
        serde_json::to_vec(&first.violations).unwrap(),
        serde_json::to_vec(&second.violations).unwrap()
    );

    let constructs = |src: &str| -> Vec<String> {
        validate_source(src, &set, &limits)
            .violations
            .into_iter()
            .map(|v| v.violating_construct)
            .collect()
    };
    assert_eq!(constructs(forward), constructs(backward));
}

#[test]
fn dangerous_constructs_blocked_even_when_elevated() {
    let set = Preset::Elevated.build("tools").unwrap();
    let report = validate_source(
        "unsafe class A { int* p; }",
        &set,
        &ValidatorLimits::default(),
    );
    assert!(report.is_rejected());
    assert!(report
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::DangerousConstruct
            || v.kind == ViolationKind::CategoryNotGranted));
}

#[test]
fn loop_heuristics_only_warn() {
    let set = Preset::Restricted.build("loops").unwrap();
    let report = validate_source(
        "class A { void F() { try { while (true) { } } catch { } } }",
        &set,
        &ValidatorLimits::default(),
    );
    assert!(!report.is_rejected());
    assert!(!report.warnings.is_empty());
}
