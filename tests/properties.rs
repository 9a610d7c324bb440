//! Property tests for pattern matching, policy algebra and document identity.

use proptest::collection::vec;
use proptest::prelude::*;
use serde_json::Value;

use stele_covenant::ccl::{self, Context, Pattern};
use stele_covenant::covenant::{self, CovenantBuilderOptions, Party};
use stele_covenant::crypto;

fn pattern_segment() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("a"), Just("b"), Just("c"), Just("*"), Just("**")]
}

fn path_segment() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("a"), Just("b"), Just("c")]
}

fn resource_pattern() -> impl Strategy<Value = String> {
    vec(pattern_segment(), 1..4).prop_map(|segs| format!("/{}", segs.join("/")))
}

fn concrete_path() -> impl Strategy<Value = String> {
    vec(path_segment(), 0..5).prop_map(|segs| format!("/{}", segs.join("/")))
}

fn statement() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("permit"), Just("deny")],
        prop_oneof![Just("read"), Just("write"), Just("*")],
        resource_pattern(),
        prop::option::of(prop_oneof![Just("role = 'admin'"), Just("level >= 2")]),
    )
        .prop_map(|(kind, action, resource, condition)| match condition {
            Some(c) => format!("{kind} {action} on '{resource}' when {c}"),
            None => format!("{kind} {action} on '{resource}'"),
        })
}

fn policy() -> impl Strategy<Value = ccl::CclDocument> {
    vec(statement(), 1..5).prop_map(|lines| {
        ccl::parse(&lines.join("\n")).unwrap_or_default()
    })
}

fn contexts() -> Vec<Context> {
    [
        serde_json::json!({}),
        serde_json::json!({"role": "admin", "level": 3}),
        serde_json::json!({"role": "guest", "level": 1}),
    ]
    .iter()
    .filter_map(|v| v.as_object().cloned())
    .collect()
}

fn sample_requests() -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    for action in ["read", "write"] {
        for path in ["/", "/a", "/b", "/a/b", "/a/c", "/b/a/c", "/c/c/c"] {
            out.push((action, path.to_string()));
        }
    }
    out
}

proptest! {
    #[test]
    fn test_double_wildcard_matches_every_descendant(
        head in path_segment(),
        tail in vec(path_segment(), 0..4),
    ) {
        let path = std::iter::once(head).chain(tail.iter().copied()).collect::<Vec<_>>().join("/");
        let under_head = ccl::match_resource(&format!("/{head}/**"), &format!("/{path}"));
        prop_assert!(under_head);
        let under_any = ccl::match_resource("**", &format!("/{path}"));
        prop_assert!(under_any);
        prop_assert_eq!(
            ccl::match_resource(&format!("/{head}/*"), &format!("/{path}")),
            tail.len() == 1
        );
    }

    #[test]
    fn test_subset_implies_match_containment(a in resource_pattern(), b in resource_pattern(), path in concrete_path()) {
        let (pa, pb) = (Pattern::resource(&a), Pattern::resource(&b));
        if pa.is_subset_of(&pb) && pa.matches(&path) {
            prop_assert!(pb.matches(&path), "{} within {} but {} only matches the first", a, b, path);
        }
    }

    #[test]
    fn test_intersection_is_sound(a in resource_pattern(), b in resource_pattern(), path in concrete_path()) {
        let (pa, pb) = (Pattern::resource(&a), Pattern::resource(&b));
        let parts = pa.intersect(&pb);
        for part in &parts {
            if part.matches(&path) {
                prop_assert!(pa.matches(&path) && pb.matches(&path), "{} from {} and {} matches {}", part, a, b, path);
            }
        }
        if pa.matches(&path) && pb.matches(&path) {
            prop_assert!(pa.overlaps(&pb));
        }
        if !pa.overlaps(&pb) {
            prop_assert!(parts.is_empty());
        }
    }

    #[test]
    fn test_serialize_parse_preserves_evaluation(doc in policy()) {
        let reparsed = ccl::parse(&ccl::serialize(&doc)).unwrap();
        prop_assert_eq!(&reparsed, &doc);
        for ctx in contexts() {
            for (action, path) in sample_requests() {
                let a = ccl::evaluate(&doc, action, &path, &ctx);
                let b = ccl::evaluate(&reparsed, action, &path, &ctx);
                prop_assert_eq!(a.permitted, b.permitted);
                prop_assert_eq!(a.matched_rule, b.matched_rule);
            }
        }
    }

    #[test]
    fn test_merge_is_idempotent(doc in policy()) {
        let merged = ccl::merge(&doc, &doc);
        for ctx in contexts() {
            for (action, path) in sample_requests() {
                prop_assert_eq!(
                    ccl::evaluate(&merged, action, &path, &ctx).permitted,
                    ccl::evaluate(&doc, action, &path, &ctx).permitted,
                    "{} {}", action, path
                );
            }
        }
    }

    #[test]
    fn test_merge_never_grants_more_than_either_side(a in policy(), b in policy()) {
        let merged = ccl::merge(&a, &b);
        for ctx in contexts() {
            for (action, path) in sample_requests() {
                if ccl::evaluate(&merged, action, &path, &ctx).permitted {
                    prop_assert!(ccl::evaluate(&a, action, &path, &ctx).permitted);
                    prop_assert!(ccl::evaluate(&b, action, &path, &ctx).permitted);
                }
            }
        }
    }

    #[test]
    fn test_sign_verify_round_trip(seed in prop::array::uniform32(any::<u8>()), message in vec(any::<u8>(), 0..256)) {
        let kp = crypto::key_pair_from_private_key(&seed).unwrap();
        let signature = crypto::sign(&message, &kp.signing_key);
        prop_assert!(crypto::verify(&message, &signature, &kp.verifying_key));
        let mut altered = message.clone();
        altered.push(0);
        prop_assert!(!crypto::verify(&altered, &signature, &kp.verifying_key));
    }

    #[test]
    fn test_canonical_json_is_a_fixed_point(
        entries in vec(("[a-zA-Z\u{e9}\u{1F600}]{1,6}", prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,8}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]), 0..8),
    ) {
        let value = Value::Object(entries.into_iter().collect());
        let canonical = crypto::canonicalize_json(&value);
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        prop_assert_eq!(crypto::canonicalize_json(&reparsed), canonical);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_canonical_form_and_id_are_deterministic(
        seed in prop::array::uniform32(any::<u8>()),
        resource in resource_pattern(),
        note in "[a-z ]{0,16}",
    ) {
        let kp = crypto::key_pair_from_private_key(&seed).unwrap();
        let other = crypto::generate_key_pair();
        let mut metadata = serde_json::Map::new();
        metadata.insert("note".into(), Value::from(note));
        let doc = covenant::build_covenant(
            CovenantBuilderOptions::new(
                Party::issuer("issuer", kp.public_key_hex.clone()),
                Party::beneficiary("beneficiary", other.public_key_hex),
                format!("permit read on '{resource}'"),
                &kp.signing_key,
            )
            .with_metadata(metadata),
        )
        .unwrap();

        prop_assert_eq!(covenant::canonical_form(&doc).unwrap(), covenant::canonical_form(&doc).unwrap());
        prop_assert_eq!(covenant::compute_id(&doc).unwrap(), doc.id.clone());

        let restored = covenant::deserialize_covenant(&covenant::serialize_covenant(&doc).unwrap()).unwrap();
        prop_assert_eq!(&restored, &doc);
        prop_assert!(covenant::verify_covenant(&restored).valid);

        let mut tampered = doc.clone();
        tampered.constraints.push_str("\ndeny write on '**'");
        let result = covenant::verify_covenant(&tampered);
        prop_assert!(!result.check("id_match").map_or(true, |c| c.passed));
        prop_assert!(!result.check("signature_valid").map_or(true, |c| c.passed));
    }
}
