use super::*;
use crate::model::ResourceKey;

fn resource(class: Option<&str>) -> RoutingResource {
    RoutingResource {
        key: ResourceKey::new("default", "foo"),
        class: class.map(str::to_string),
        resource_version: None,
        rules: vec![],
    }
}

#[test]
fn test_default_mode_owns_only_unmarked() {
    let identity = ControllerIdentity::default_mode();

    assert!(is_owned(&resource(None), &identity));
    assert!(!is_owned(&resource(Some("testclass")), &identity));
}

#[test]
fn test_explicit_mode_owns_only_matching_marker() {
    let identity = ControllerIdentity::explicit("testclass");

    assert!(is_owned(&resource(Some("testclass")), &identity));
    assert!(!is_owned(&resource(None), &identity), "absent marker is not owned");
    assert!(!is_owned(&resource(Some("other")), &identity));
}

#[test]
fn test_explicit_mode_is_case_sensitive_without_wildcards() {
    let identity = ControllerIdentity::explicit("testclass");

    assert!(!is_owned(&resource(Some("TestClass")), &identity));
    assert!(!is_owned(&resource(Some("test*")), &identity));
    assert!(!is_owned(&resource(Some("testclass ")), &identity));
}

#[test]
fn test_empty_class_selects_default_mode() {
    let identity = ControllerIdentity::new("", false);

    assert_eq!(identity, ControllerIdentity::default_mode());
    assert_eq!(identity.class(), None);
    assert!(identity.owns_unclassed());
}

#[test]
fn test_empty_marker_counts_as_absent() {
    assert!(ControllerIdentity::default_mode().matches(Some("")));
    assert!(!ControllerIdentity::explicit("testclass").matches(Some("")));
}

#[test]
fn test_watch_without_class_also_claims_unmarked() {
    let identity = ControllerIdentity::new("testclass", true);

    assert!(is_owned(&resource(None), &identity));
    assert!(is_owned(&resource(Some("testclass")), &identity));
    assert!(!is_owned(&resource(Some("other")), &identity));
}

#[test]
fn test_removing_marker_revokes_ownership() {
    let identity = ControllerIdentity::explicit("testclass");
    let mut foo = resource(Some("testclass"));
    assert!(is_owned(&foo, &identity));

    foo.class = None;
    assert!(!is_owned(&foo, &identity));
}
