//! Condition evaluator tests — operator semantics, dotted-path lookup,
//! fail-closed behavior on type mismatches and over-deep trees.

use caseops_core::condition::{evaluate, Condition, Operator, DEFAULT_MAX_DEPTH};
use caseops_core::snapshot::EntitySnapshot;
use serde_json::json;

fn snapshot() -> EntitySnapshot {
    EntitySnapshot::new(json!({
        "kycStatus": "rejected",
        "amount": 15000,
        "score": 0.42,
        "tags": ["pep", "dormant"],
        "counterparty": { "country": "IR", "name": "Acme Trading" }
    }))
}

fn leaf(field: &str, op: Operator, value: serde_json::Value) -> Condition {
    Condition::Leaf { field: field.into(), op, value }
}

#[test]
fn equals_matches_exact_value() {
    let tree = leaf("kycStatus", Operator::Equals, json!("rejected"));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("kycStatus", Operator::Equals, json!("verified"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn numeric_equality_spans_int_and_float() {
    // 15000 stored as an integer must equal 15000.0 from configuration.
    let tree = leaf("amount", Operator::Equals, json!(15000.0));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn gt_and_lt_compare_numbers() {
    assert!(evaluate(&leaf("amount", Operator::Gt, json!(10000)), &snapshot(), DEFAULT_MAX_DEPTH));
    assert!(!evaluate(&leaf("amount", Operator::Gt, json!(20000)), &snapshot(), DEFAULT_MAX_DEPTH));
    assert!(evaluate(&leaf("score", Operator::Lt, json!(0.5)), &snapshot(), DEFAULT_MAX_DEPTH));
}

/// Comparing a string field with gt is a type mismatch: false, not a crash.
#[test]
fn type_mismatch_fails_closed() {
    let tree = leaf("kycStatus", Operator::Gt, json!(100));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("amount", Operator::Contains, json!("15"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

/// A missing field is a non-match for every operator, negated ones included.
#[test]
fn missing_field_fails_closed() {
    let tree = leaf("noSuchField", Operator::Equals, json!("x"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("noSuchField", Operator::NotEquals, json!("x"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("noSuchField", Operator::NotIn, json!(["x"]));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn dotted_path_resolves_nested_objects() {
    let tree = leaf("counterparty.country", Operator::Equals, json!("IR"));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("counterparty.missing.deeper", Operator::Equals, json!(1));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn contains_works_for_substrings_and_array_membership() {
    let tree = leaf("counterparty.name", Operator::Contains, json!("Trading"));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("tags", Operator::Contains, json!("pep"));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("tags", Operator::Contains, json!("sanctioned"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn in_and_not_in_check_candidate_lists() {
    let tree = leaf("counterparty.country", Operator::In, json!(["IR", "KP"]));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    let tree = leaf("counterparty.country", Operator::NotIn, json!(["US", "DE"]));
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    // A non-array candidate list is malformed configuration: fail closed.
    let tree = leaf("counterparty.country", Operator::In, json!("IR"));
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

/// Vacuous truth: empty AND is true, empty OR is false.
#[test]
fn empty_combinators() {
    let all = Condition::All { children: vec![] };
    assert!(evaluate(&all, &snapshot(), DEFAULT_MAX_DEPTH));

    let any = Condition::Any { children: vec![] };
    assert!(!evaluate(&any, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn nested_combinators_evaluate_recursively() {
    let tree = Condition::All {
        children: vec![
            leaf("kycStatus", Operator::Equals, json!("rejected")),
            Condition::Any {
                children: vec![
                    leaf("amount", Operator::Gt, json!(100000)),
                    leaf("counterparty.country", Operator::In, json!(["IR"])),
                ],
            },
        ],
    };
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

/// A tree past the depth cap is a configuration error and a non-match,
/// even when the underlying predicate would have been true.
#[test]
fn over_deep_tree_fails_closed() {
    let mut tree = leaf("kycStatus", Operator::Equals, json!("rejected"));
    for _ in 0..DEFAULT_MAX_DEPTH {
        tree = Condition::All { children: vec![tree] };
    }
    assert!(!evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));

    // The same shape within the cap matches fine.
    let mut tree = leaf("kycStatus", Operator::Equals, json!("rejected"));
    for _ in 0..DEFAULT_MAX_DEPTH - 2 {
        tree = Condition::All { children: vec![tree] };
    }
    assert!(evaluate(&tree, &snapshot(), DEFAULT_MAX_DEPTH));
}

#[test]
fn leaf_fields_lists_every_referenced_path() {
    let tree = Condition::All {
        children: vec![
            leaf("kycStatus", Operator::Equals, json!("rejected")),
            Condition::Any {
                children: vec![
                    leaf("amount", Operator::Gt, json!(1)),
                    leaf("counterparty.country", Operator::In, json!(["IR"])),
                ],
            },
        ],
    };
    assert_eq!(tree.leaf_fields(), vec!["kycStatus", "amount", "counterparty.country"]);
}
