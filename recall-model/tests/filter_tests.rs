use recall_model::{Filter, FilterClause};
use serde_json::json;

#[test]
fn empty_filter_matches_everything() {
    let f = Filter::new();
    assert!(f.is_empty());
    assert!(f.matches(&json!({"id": "a"})));
}

#[test]
fn eq_clause() {
    let f = Filter::new().eq("board_id", "b1");
    assert!(f.matches(&json!({"id": "s1", "board_id": "b1"})));
    assert!(!f.matches(&json!({"id": "s2", "board_id": "b2"})));
    assert!(!f.matches(&json!({"id": "s3"})));
}

#[test]
fn eq_on_id() {
    let f = Filter::new().eq("id", "a1");
    assert!(f.matches(&json!({"id": "a1"})));
    assert!(!f.matches(&json!({"id": "a2"})));
}

#[test]
fn in_clause() {
    let f = Filter::new().any_of("year", [1999, 2001]);
    assert!(f.matches(&json!({"year": 2001})));
    assert!(!f.matches(&json!({"year": 2000})));
}

#[test]
fn is_null_clause_accepts_missing_and_null() {
    let f = Filter::new().is_null("deleted_at");
    assert!(f.matches(&json!({})));
    assert!(f.matches(&json!({"deleted_at": null})));
    assert!(!f.matches(&json!({"deleted_at": 5})));
}

#[test]
fn clauses_are_conjunctive() {
    let f = Filter::new().eq("kind", "pdf").eq("favorite", true);
    assert!(f.matches(&json!({"kind": "pdf", "favorite": true})));
    assert!(!f.matches(&json!({"kind": "pdf", "favorite": false})));
}

#[test]
fn filter_serializes_with_tagged_clauses() {
    let f = Filter::new().eq("a", 1);
    let value = serde_json::to_value(&f).unwrap();
    assert_eq!(value, json!({"clauses": [{"op": "eq", "field": "a", "value": 1}]}));
    let back: Filter = serde_json::from_value(value).unwrap();
    assert_eq!(back.clauses[0], FilterClause::Eq { field: "a".into(), value: json!(1) });
}
