mod common;

use serde_json::json;

use apimux_format::EndpointSignature;
use apimux_scheduling::{AccessRestrictions, AllowedModels, merge_allowed_models};
use apimux_storage::{ApiKeyRow, UserRow};

fn sig(s: &str) -> EndpointSignature {
    s.parse().unwrap()
}

fn caller_key(models: Option<serde_json::Value>) -> ApiKeyRow {
    ApiKeyRow {
        id: 1,
        user_id: 7,
        key_hash: "hash".to_string(),
        is_active: true,
        allowed_providers: None,
        allowed_models: models,
        allowed_api_formats: None,
    }
}

fn owner(models: Option<serde_json::Value>) -> UserRow {
    UserRow {
        id: 7,
        name: "owner".to_string(),
        is_active: true,
        allowed_providers: None,
        allowed_models: models,
        allowed_api_formats: None,
    }
}

#[test]
fn api_key_axis_wins_over_user_axis() {
    let key = caller_key(Some(json!(["gpt-4o"])));
    let user = owner(Some(json!(["claude-sonnet"])));
    let restrictions = AccessRestrictions::from_caller(Some(&key), Some(&user));

    assert!(restrictions.is_model_allowed("gpt-4o", None, None));
    assert!(!restrictions.is_model_allowed("claude-sonnet", None, None));
}

#[test]
fn user_axis_is_fallback_when_key_sets_nothing() {
    let key = caller_key(None);
    let user = owner(Some(json!(["claude-sonnet"])));
    let restrictions = AccessRestrictions::from_caller(Some(&key), Some(&user));

    assert!(restrictions.is_model_allowed("claude-sonnet", None, None));
    assert!(!restrictions.is_model_allowed("gpt-4o", None, None));
}

#[test]
fn unrestricted_when_neither_side_sets_an_axis() {
    let restrictions =
        AccessRestrictions::from_caller(Some(&caller_key(None)), Some(&owner(None)));
    assert!(restrictions.is_model_allowed("anything", None, None));
    assert!(restrictions.is_provider_allowed(12345));
    assert!(restrictions.is_api_format_allowed(&sig("gemini:video")));
}

#[test]
fn list_list_merge_is_sorted_intersection() {
    let a = AllowedModels::List(vec!["b".into(), "a".into(), "c".into()]);
    let b = AllowedModels::List(vec!["c".into(), "b".into(), "x".into()]);
    let merged = merge_allowed_models(Some(&a), Some(&b)).unwrap();
    assert_eq!(merged, AllowedModels::List(vec!["b".into(), "c".into()]));

    let disjoint = AllowedModels::List(vec!["z".into()]);
    let merged = merge_allowed_models(Some(&a), Some(&disjoint)).unwrap();
    // Empty list means deny-all, which is narrower than either input.
    assert_eq!(merged, AllowedModels::List(Vec::new()));
}

#[test]
fn map_merge_never_downgrades_to_list() {
    let list = AllowedModels::List(vec!["m1".into(), "m2".into()]);
    let map = AllowedModels::decode(&json!({ "openai:chat": ["m2", "m3"] })).unwrap();

    let merged = merge_allowed_models(Some(&list), Some(&map)).unwrap();
    let AllowedModels::ByFormat(formats) = &merged else {
        panic!("expected the merge to stay in map shape");
    };
    // Under openai:chat both sides constrain: intersection.
    assert_eq!(formats.get("openai:chat"), Some(&vec!["m2".to_string()]));

    // Under an unenumerated format only the list side constrains.
    assert!(merged.allows("m1", Some(&sig("claude:chat")), None));
    assert!(!merged.allows("m3", Some(&sig("claude:chat")), None));
    assert!(!merged.allows("m1", Some(&sig("openai:chat")), None));
}

#[test]
fn one_sided_merge_returns_the_other_side() {
    let a = AllowedModels::List(vec!["m1".into()]);
    assert_eq!(merge_allowed_models(Some(&a), None), Some(a.clone()));
    assert_eq!(merge_allowed_models(None, Some(&a)), Some(a.clone()));
    assert_eq!(merge_allowed_models(None, None), None);
}

#[test]
fn map_mode_wildcard_covers_unlisted_formats() {
    let map =
        AllowedModels::decode(&json!({ "*": ["m1"], "openai:chat": ["m2"] })).unwrap();
    assert!(map.allows("m2", Some(&sig("openai:chat")), None));
    assert!(!map.allows("m1", Some(&sig("openai:chat")), None));
    assert!(map.allows("m1", Some(&sig("claude:chat")), None));
    assert!(!map.allows("m2", Some(&sig("claude:chat")), None));
}

#[test]
fn malformed_axis_fails_closed() {
    let key = caller_key(Some(json!("not-a-list")));
    let restrictions = AccessRestrictions::from_caller(Some(&key), None);
    assert!(!restrictions.is_model_allowed("gpt-4o", None, None));
}

#[test]
fn alias_resolution_passes_whitelist_on_canonical_name() {
    let key = caller_key(Some(json!(["gpt-4o"])));
    let restrictions = AccessRestrictions::from_caller(Some(&key), None);
    assert!(restrictions.is_model_allowed("gpt-4o-upstream", None, Some("gpt-4o")));
    assert!(!restrictions.is_model_allowed("gpt-4o-upstream", None, Some("other")));
}
