// tests/extract_markers.rs
use deep_research_report::extract::{
    extract_claims, rewrite_markers, sanitize_malformed, scan_markers,
};
use deep_research_report::MalformedMarkerError;

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn one_claim_per_marker_with_its_sentence() {
    let content = "Trapped ions stay coherent for seconds [1]. Superconducting qubits decohere faster [2, 3].";
    let claims = extract_claims(4, content, &[]).unwrap();
    assert_eq!(claims.len(), 2);

    assert_eq!(claims[0].section_id, 4);
    assert_eq!(claims[0].text, "Trapped ions stay coherent for seconds");
    assert_eq!(claims[0].raw_marker_ids, ids(&["1"]));
    assert_eq!(&content[claims[0].marker_span.clone()], "[1]");

    assert_eq!(claims[1].text, "Superconducting qubits decohere faster");
    assert_eq!(claims[1].raw_marker_ids, ids(&["2", "3"]));
    assert_eq!(&content[claims[1].text_span.clone()], claims[1].text);
}

#[test]
fn adjacent_markers_share_the_claim() {
    let claims = extract_claims(0, "Error rates fell sharply [1] [2].", &[]).unwrap();
    assert_eq!(claims.len(), 2);
    assert_eq!(claims[0].text, "Error rates fell sharply");
    assert_eq!(claims[1].text, claims[0].text);
    assert_eq!(claims[1].raw_marker_ids, ids(&["2"]));
}

#[test]
fn leading_marker_attaches_to_the_following_sentence() {
    let claims = extract_claims(0, "[1] Trapped ions hold coherence. Other prose.", &[]).unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].text, "Trapped ions hold coherence.");
}

#[test]
fn draft_without_markers_has_no_claims() {
    let claims = extract_claims(0, "Nothing is cited here. Not even [sic] this.", &[]).unwrap();
    assert!(claims.is_empty());
}

#[test]
fn structural_errors_are_malformed() {
    assert!(matches!(
        extract_claims(0, "Open bracket [1 never closes.", &[]),
        Err(MalformedMarkerError::Unbalanced { bracket: '[', .. })
    ));
    assert!(matches!(
        extract_claims(0, "Nested [[1]] marker.", &[]),
        Err(MalformedMarkerError::Nested { .. })
    ));
    assert!(matches!(
        scan_markers("stray close 2] here"),
        Err(MalformedMarkerError::Unbalanced { bracket: ']', .. })
    ));
}

#[test]
fn undeclared_ids_only_fail_against_a_declared_list() {
    let err = extract_claims(0, "Claim [1]. Other claim [3].", &ids(&["1", "2"])).unwrap_err();
    match err {
        MalformedMarkerError::UndeclaredId { id, .. } => assert_eq!(id, "3"),
        other => panic!("unexpected error: {other:?}"),
    }
    // Leading zeros are normalised on both sides.
    assert!(extract_claims(0, "Claim [01].", &ids(&["1"])).is_ok());
    // Empty declared list is the pre-grounding state.
    assert_eq!(extract_claims(0, "Claim [9].", &[]).unwrap().len(), 1);
}

#[test]
fn removed_markers_take_their_spacing_with_them() {
    let out = rewrite_markers("Alpha holds [1]. Beta holds [2], gamma [3].", |i, _| {
        (i == 0).then(|| "[7]".to_string())
    })
    .unwrap();
    assert_eq!(out, "Alpha holds [7]. Beta holds, gamma.");
}

#[test]
fn malformed_content_is_sanitised_without_brackets() {
    let out = sanitize_malformed("Claim [1 and [2] more [3, 4].");
    assert_eq!(out, "Claim 1 and more.");
    assert!(!out.contains('[') && !out.contains(']'));
}
