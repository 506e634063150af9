//! Spec loading integration tests.
//!
//! Both spec syntaxes must produce the same work graph, and invalid specs
//! must be rejected before anything becomes runnable.

use harness::classify::Classifier;
use harness::core::{AcceptanceCriterion, ComplexityTier, Priority, RepositoryId, WorkState};
use harness::orchestration::{fan_out, RoutingTable};
use harness::spec::{load_path, load_str, SpecSyntax, WorkSpec};
use harness::{Error, Scheduler, SchedulerPolicy};

const CHECKOUT_TOML: &str = r#"
title = "Checkout"
property = "storefront"
requirements = ["no new dependencies"]

[[features]]
title = "Session store"
priority = 1
labels = ["db"]
files = ["src/session.rs"]
acceptance = ["sessions expire"]

[[features]]
title = "Cart persistence"
priority = 0
depends_on = ["Session store"]
labels = ["api", "db"]
files = ["src/cart.rs", "src/cart/store.rs"]
acceptance = [
    "carts survive restarts",
    { description = "cart api responds", verify = "cargo test cart" },
]
"#;

const CHECKOUT_TEXT: &str = "\
# Checkout
Property: storefront

## Features
### Session store
Priority: P1
Labels: db
Files:
- src/session.rs
Acceptance:
- sessions expire

### Cart persistence
Priority: P0
Labels: api, db
Depends on: Session store
Files:
- src/cart.rs
- src/cart/store.rs
Acceptance:
- carts survive restarts
- cart api responds :: verify: cargo test cart

## Requirements
- no new dependencies
";

/// Dependency titles per item, in declaration order.
fn dependency_titles(spec: &WorkSpec) -> Vec<(String, Vec<String>)> {
    spec.items
        .iter()
        .map(|item| {
            let deps = item
                .depends_on
                .iter()
                .filter_map(|dep| spec.items.iter().find(|i| i.id == *dep))
                .map(|dep| dep.title.clone())
                .collect();
            (item.title.clone(), deps)
        })
        .collect()
}

/// Test: Both syntaxes normalize to the same spec
/// Given the same checkout spec as TOML and as structured text
/// When both are loaded
/// Then titles, priorities, labels, files, acceptance and edges match
#[test]
fn test_toml_and_text_syntax_are_equivalent() {
    let toml = load_str(CHECKOUT_TOML, SpecSyntax::Toml).unwrap();
    let text = load_str(CHECKOUT_TEXT, SpecSyntax::Text).unwrap();

    assert_eq!(toml.title, text.title);
    assert_eq!(toml.property, Some(RepositoryId::from("storefront")));
    assert_eq!(toml.property, text.property);
    assert_eq!(toml.requirements, text.requirements);
    assert_eq!(toml.items.len(), 2);
    assert_eq!(text.items.len(), 2);

    for (a, b) in toml.items.iter().zip(&text.items) {
        assert_eq!(a.title, b.title);
        assert_eq!(a.priority, b.priority);
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.files, b.files);
        assert_eq!(a.acceptance, b.acceptance);
        assert_eq!(a.repository, b.repository);
        assert_eq!(a.order, b.order);
    }
    assert_eq!(dependency_titles(&toml), dependency_titles(&text));

    let cart = text.item("Cart persistence").unwrap();
    assert_eq!(cart.priority, Priority::P0);
    assert_eq!(
        cart.acceptance[1],
        AcceptanceCriterion::Verified {
            description: "cart api responds".to_string(),
            verify: "cargo test cart".to_string(),
        }
    );
}

/// Test: JSON is another declarative syntax
#[test]
fn test_load_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkout.json");
    std::fs::write(
        &path,
        r#"{"title": "Checkout", "features": [{"title": "Cart", "labels": ["api"]}]}"#,
    )
    .unwrap();

    let spec = load_path(&path).unwrap();
    assert_eq!(spec.title, "Checkout");
    assert_eq!(spec.items[0].title, "Cart");
    assert!(spec.items[0].has_label("api"));
    assert_eq!(spec.items[0].priority, Priority::P2);
}

/// Test: Dependency cycles are rejected
/// Given features A -> B -> A
/// When the spec is loaded
/// Then loading fails naming both features and nothing is scheduled
#[test]
fn test_cycle_rejected_before_anything_runs() {
    let content = r#"
title = "Loop"

[[features]]
title = "A"
depends_on = ["B"]

[[features]]
title = "B"
depends_on = ["A"]
"#;
    match load_str(content, SpecSyntax::Toml) {
        Err(Error::SpecFormat { field, message }) => {
            assert!(field.contains("depends_on"), "field was {field}");
            assert!(message.contains('A') && message.contains('B'), "{message}");
        }
        other => panic!("expected a spec format error, got {other:?}"),
    }
}

/// Test: Unresolved references name the offending field
#[test]
fn test_unknown_dependency_names_field() {
    let content = "\
# Checkout

## Features
### Cart
### Payment
Depends on: Ledger
";
    let err = load_str(content, SpecSyntax::Text).unwrap_err();
    match err {
        Error::SpecFormat { field, message } => {
            assert_eq!(field, "features[1].depends_on");
            assert!(message.contains("Ledger"));
        }
        other => panic!("expected a spec format error, got {other:?}"),
    }
}

/// Test: A spec without features is invalid
#[test]
fn test_empty_spec_rejected() {
    let err = load_str("title = \"Nothing\"\n", SpecSyntax::Toml).unwrap_err();
    assert!(matches!(err, Error::SpecFormat { ref field, .. } if field == "features"));
}

/// Test: A loaded spec schedules its roots first
#[test]
fn test_loaded_spec_schedules_roots() {
    let spec = load_str(CHECKOUT_TOML, SpecSyntax::Toml).unwrap();
    let scheduler = Scheduler::from_spec(&spec, SchedulerPolicy::default()).unwrap();

    let session = scheduler.find("Session store").unwrap();
    let cart = scheduler.find("Cart persistence").unwrap();
    assert_eq!(session.state, WorkState::Runnable);
    assert_eq!(cart.state, WorkState::Pending);
    assert_eq!(scheduler.next_runnable().unwrap().id, session.id);
}

/// Test: Compound features fan out per repository
/// Given routing of `api` to backend and `ui` to frontend
/// When a feature carrying both labels is fanned out
/// Then it becomes two ordered siblings and its dependents wait on both
#[test]
fn test_compound_feature_fans_out() {
    let content = r#"
title = "Profile"

[[features]]
title = "Avatar upload"
labels = ["api", "ui"]

[[features]]
title = "Avatar docs"
depends_on = ["Avatar upload"]
"#;
    let mut spec = load_str(content, SpecSyntax::Toml).unwrap();
    let table = RoutingTable::new()
        .with_default(RepositoryId::from("docs"))
        .route_label("api", RepositoryId::from("backend"))
        .route_label("ui", RepositoryId::from("frontend"));
    fan_out(&mut spec, &table);

    let titles: Vec<&str> = spec.items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Avatar upload [backend]", "Avatar upload [frontend]", "Avatar docs"]
    );
    let backend = &spec.items[0];
    let frontend = &spec.items[1];
    let docs = &spec.items[2];
    assert_eq!(backend.repository, RepositoryId::from("backend"));
    assert_eq!(frontend.repository, RepositoryId::from("frontend"));
    assert_eq!(docs.repository, RepositoryId::from("docs"));
    assert_eq!(frontend.depends_on, vec![backend.id]);
    assert_eq!(docs.depends_on, vec![backend.id, frontend.id]);

    let scheduler = Scheduler::from_spec(&spec, SchedulerPolicy::default()).unwrap();
    assert_eq!(scheduler.runnable().len(), 1);
}

/// Test: File count drives the complexity tier
/// Given a feature listing 16 files
/// When the spec is classified
/// Then the feature is complex and maps to the heavy capability
#[test]
fn test_many_files_classified_complex() {
    let files: Vec<String> = (0..16).map(|i| format!("- src/module_{i}.rs")).collect();
    let content = format!(
        "# Wide change\n\n## Features\n### Rename types\nFiles:\n{}\n",
        files.join("\n")
    );
    let mut spec = load_str(&content, SpecSyntax::Text).unwrap();
    let highest = Classifier::new().classify_spec(&mut spec);

    assert_eq!(highest, ComplexityTier::Complex);
    let classification = spec.items[0].classification.as_ref().unwrap();
    assert_eq!(classification.tier, ComplexityTier::Complex);
    assert!(!classification.overridden);
}

/// Test: The spec's complexity header overrides classification
#[test]
fn test_spec_complexity_override() {
    let content = "# Small\nComplexity: complex\n\n## Features\n### Typo fix\n";
    let mut spec = load_str(content, SpecSyntax::Text).unwrap();
    assert_eq!(spec.complexity, Some(ComplexityTier::Complex));

    Classifier::new().classify_spec(&mut spec);
    let classification = spec.items[0].classification.as_ref().unwrap();
    assert_eq!(classification.tier, ComplexityTier::Complex);
    assert!(classification.overridden);
}
