//! Sanitizers mapping foreign identifiers into cluster naming grammars
//!
//! Module ids, device ids, hub names, host paths, and docker label keys all
//! originate outside the cluster and routinely violate its naming rules.
//! Three grammars cover every name gantry writes:
//!
//! - DNS label (RFC 1035): object names, selector values, volume and port
//!   names. Lowercase alphanumerics and `-`, starts with a letter, ends
//!   alphanumeric, at most 63 characters.
//! - DNS subdomain: resource names and annotation-key prefixes. Dot-joined
//!   DNS labels, at most 253 characters.
//! - Name-value: annotation-key names and label values. Alphanumerics plus
//!   `-`, `_`, `.`, begins and ends alphanumeric, at most 63 characters.
//!
//! Every function is a pure, idempotent, lossy projection: invalid
//! characters are silently elided, never replaced. Two distinct inputs may
//! map to the same output, so uniqueness always comes from compound inputs
//! (device+module, not module alone), never from these functions.

/// Maximum length of a DNS label and of a name-value string
const LABEL_MAX_LEN: usize = 63;

/// Maximum length of a DNS subdomain and of a generic resource name
const SUBDOMAIN_MAX_LEN: usize = 253;

/// Sanitize a string into a generic resource name.
///
/// ASCII-lowercases the input, keeps alphanumerics, `.` and `-`, elides
/// everything else, and truncates to 253 characters. Unlike
/// [`sanitize_dns_label`] this performs no edge trimming; it is the loosest
/// of the grammars and is used for the expected document resource name.
pub fn sanitize_resource_name(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        if out.len() >= SUBDOMAIN_MAX_LEN {
            break;
        }
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
        }
    }
    out
}

/// Sanitize a string into a DNS label (RFC 1035).
///
/// ASCII-lowercases the input, drops leading characters up to the first
/// letter, keeps alphanumerics and `-`, elides everything else, truncates
/// to 63 characters, and trims trailing non-alphanumerics left by the cut.
///
/// Object names, selector values, volume names and port names all go
/// through here.
pub fn sanitize_dns_label(s: &str) -> String {
    sanitize_dns_segment(s, LABEL_MAX_LEN)
}

/// DNS-label sanitization against an explicit length budget.
fn sanitize_dns_segment(s: &str, max_len: usize) -> String {
    let lower = s.to_ascii_lowercase();
    let mut out = String::new();
    for c in lower.chars().skip_while(|c| !c.is_ascii_alphabetic()) {
        if out.len() >= max_len {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        }
    }
    out.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Sanitize a string into a DNS subdomain.
///
/// Splits on `.`, sanitizes each segment as a DNS label against the
/// remaining budget of 253 characters (dots included, segments still capped
/// at 63), drops segments that sanitize to nothing, and rejoins. A fully
/// invalid input yields the empty string.
pub fn sanitize_dns_subdomain(s: &str) -> String {
    let mut out = String::new();
    let mut remaining = SUBDOMAIN_MAX_LEN;
    for segment in s.split('.') {
        let label = sanitize_dns_segment(segment, remaining.min(LABEL_MAX_LEN));
        if label.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&label);
        match remaining.checked_sub(label.len() + 1) {
            Some(r) if r > 0 => remaining = r,
            _ => break,
        }
    }
    out
}

/// Sanitize a string into an annotation key.
///
/// An annotation key is an optional DNS-subdomain prefix and a name-value
/// part separated by the last `/`. The prefix is sanitized as a subdomain;
/// the name keeps its original case and follows the name-value grammar.
pub fn sanitize_annotation_key(s: &str) -> String {
    match s.rsplit_once('/') {
        Some((prefix, name)) => format!(
            "{}/{}",
            sanitize_dns_subdomain(prefix),
            sanitize_name_value(name)
        ),
        None => sanitize_name_value(s),
    }
}

/// Sanitize a string into a label value.
///
/// ASCII-lowercases the input and applies the name-value grammar. Label
/// values on owned objects double as selector terms, so they share the
/// case folding of [`sanitize_dns_label`].
pub fn sanitize_label_value(s: &str) -> String {
    sanitize_name_value(&s.to_ascii_lowercase())
}

/// Name-value grammar: alphanumerics plus `-`, `_`, `.`, begins and ends
/// alphanumeric, at most 63 characters. Case is preserved.
fn sanitize_name_value(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars().skip_while(|c| !c.is_ascii_alphanumeric()) {
        if out.len() >= LABEL_MAX_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
            out.push(c);
        }
    }
    out.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // =========================================================================
    // DNS Labels
    // =========================================================================

    #[test]
    fn test_dns_label_lowercases() {
        assert_eq!(sanitize_dns_label("edgeHub"), "edgehub");
        assert_eq!(sanitize_dns_label("Telemetry"), "telemetry");
    }

    #[test]
    fn test_dns_label_drops_leading_non_alpha() {
        assert_eq!(sanitize_dns_label("$edgeHub"), "edgehub");
        assert_eq!(sanitize_dns_label("12edgeHub"), "edgehub");
        assert_eq!(sanitize_dns_label("--camera"), "camera");
    }

    #[test]
    fn test_dns_label_elides_invalid_characters() {
        assert_eq!(sanitize_dns_label("edge_hub"), "edgehub");
        assert_eq!(sanitize_dns_label("edge hub 2"), "edgehub2");
        assert_eq!(sanitize_dns_label("edge-hub"), "edge-hub");
    }

    #[test]
    fn test_dns_label_trims_trailing_dashes() {
        assert_eq!(sanitize_dns_label("camera--"), "camera");
        assert_eq!(sanitize_dns_label("cam-01-"), "cam-01");
    }

    #[test]
    fn test_dns_label_empty_and_all_invalid() {
        assert_eq!(sanitize_dns_label(""), "");
        assert_eq!(sanitize_dns_label("---"), "");
        assert_eq!(sanitize_dns_label("_$!"), "");
        assert_eq!(sanitize_dns_label("1234"), "");
    }

    #[test]
    fn test_dns_label_truncates_and_retrims() {
        let input = format!("{}-{}", "a".repeat(62), "b".repeat(20));
        let out = sanitize_dns_label(&input);
        // 63rd character would be the dash; it gets cut and re-trimmed
        assert_eq!(out, "a".repeat(62));
        assert!(out.len() <= 63);
    }

    // =========================================================================
    // Resource Names
    // =========================================================================

    #[test]
    fn test_resource_name_keeps_dots_and_dashes() {
        assert_eq!(sanitize_resource_name("Edge.Device-01"), "edge.device-01");
    }

    #[test]
    fn test_resource_name_elides_silently() {
        assert_eq!(sanitize_resource_name("My Device #1"), "mydevice1");
        assert_eq!(sanitize_resource_name("dev_ice"), "device");
    }

    #[test]
    fn test_resource_name_no_edge_trimming() {
        // unlike DNS labels, leading digits and edge punctuation survive
        assert_eq!(sanitize_resource_name("1device."), "1device.");
        assert_eq!(sanitize_resource_name("-x-"), "-x-");
    }

    #[test]
    fn test_resource_name_truncates_at_253() {
        let out = sanitize_resource_name(&"x".repeat(300));
        assert_eq!(out.len(), 253);
    }

    // =========================================================================
    // DNS Subdomains
    // =========================================================================

    #[test]
    fn test_subdomain_sanitizes_per_segment() {
        assert_eq!(sanitize_dns_subdomain("Web.Module_A"), "web.modulea");
    }

    #[test]
    fn test_subdomain_drops_empty_segments() {
        assert_eq!(sanitize_dns_subdomain("web..x"), "web.x");
        assert_eq!(sanitize_dns_subdomain(".web."), "web");
        assert_eq!(sanitize_dns_subdomain("12.34"), "");
    }

    #[test]
    fn test_subdomain_respects_segment_and_total_budgets() {
        let input = format!("{}.{}", "a".repeat(200), "b".repeat(200));
        let out = sanitize_dns_subdomain(&input);
        assert_eq!(out, format!("{}.{}", "a".repeat(63), "b".repeat(63)));

        // the segment that no longer fits is clipped, not dropped
        let many = vec!["seg"; 100].join(".");
        let out = sanitize_dns_subdomain(&many);
        assert!(out.len() <= 253);
        let mut segments: Vec<&str> = out.split('.').collect();
        let last = segments.pop().unwrap();
        assert!(segments.iter().all(|s| *s == "seg"));
        assert!("seg".starts_with(last));
    }

    // =========================================================================
    // Annotation Keys
    // =========================================================================

    #[test]
    fn test_annotation_key_without_prefix_keeps_case() {
        assert_eq!(sanitize_annotation_key("Agent.NET"), "Agent.NET");
        assert_eq!(sanitize_annotation_key("Version_1"), "Version_1");
    }

    #[test]
    fn test_annotation_key_prefix_is_subdomain() {
        assert_eq!(
            sanitize_annotation_key("com.Example/Label_Key!"),
            "com.example/Label_Key"
        );
        assert_eq!(
            sanitize_annotation_key("gantry.dev/Module.ID"),
            "gantry.dev/Module.ID"
        );
    }

    #[test]
    fn test_annotation_key_splits_on_last_slash() {
        // only the final slash separates prefix from name; earlier ones are
        // swallowed by the subdomain grammar
        assert_eq!(sanitize_annotation_key("a/b/c"), "ab/c");
    }

    #[test]
    fn test_annotation_key_name_trims_edges() {
        assert_eq!(sanitize_annotation_key("_key_"), "key");
        assert_eq!(sanitize_annotation_key("x/_key_"), "x/key");
    }

    // =========================================================================
    // Label Values
    // =========================================================================

    #[test]
    fn test_label_value_lowercases() {
        assert_eq!(sanitize_label_value("MsIoT"), "msiot");
        assert_eq!(sanitize_label_value("Edge_Agent"), "edge_agent");
    }

    #[test]
    fn test_label_value_trims_edges() {
        assert_eq!(sanitize_label_value("_internal-"), "internal");
        assert_eq!(sanitize_label_value("9fleet"), "9fleet");
    }

    // =========================================================================
    // Properties: idempotence and output grammar
    // =========================================================================
    //
    // All five sanitizers are projections: applying one twice must equal
    // applying it once, and the output must satisfy the target grammar for
    // every conceivable input.

    fn is_dns_label(s: &str) -> bool {
        s.len() <= 63
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && s.chars().next().map_or(true, |c| c.is_ascii_lowercase())
            && s.chars().last().map_or(true, |c| c.is_ascii_alphanumeric())
    }

    fn is_name_value(s: &str) -> bool {
        s.len() <= 63
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
            && s.chars().next().map_or(true, |c| c.is_ascii_alphanumeric())
            && s.chars().last().map_or(true, |c| c.is_ascii_alphanumeric())
    }

    proptest! {
        #[test]
        fn prop_resource_name_idempotent(s in any::<String>()) {
            let once = sanitize_resource_name(&s);
            prop_assert_eq!(sanitize_resource_name(&once), once.clone());
            prop_assert!(once.len() <= 253);
            prop_assert!(once.chars().all(|c| c.is_ascii_lowercase()
                || c.is_ascii_digit() || c == '-' || c == '.'));
        }

        #[test]
        fn prop_dns_label_idempotent_and_valid(s in any::<String>()) {
            let once = sanitize_dns_label(&s);
            prop_assert_eq!(sanitize_dns_label(&once), once.clone());
            prop_assert!(is_dns_label(&once), "not a DNS label: {:?}", once);
        }

        #[test]
        fn prop_subdomain_idempotent_and_valid(s in "[a-zA-Z0-9._$ -]{0,300}") {
            let once = sanitize_dns_subdomain(&s);
            prop_assert_eq!(sanitize_dns_subdomain(&once), once.clone());
            prop_assert!(once.len() <= 253);
            for segment in once.split('.').filter(|seg| !seg.is_empty()) {
                prop_assert!(is_dns_label(segment), "bad segment: {:?}", segment);
            }
            prop_assert!(once.is_empty() || !once.contains(".."));
        }

        #[test]
        fn prop_annotation_key_idempotent(s in "[a-zA-Z0-9._/$ -]{0,300}") {
            let once = sanitize_annotation_key(&s);
            prop_assert_eq!(sanitize_annotation_key(&once), once.clone());
            // at most the one separating slash survives
            prop_assert!(once.matches('/').count() <= 1);
            let name = once.rsplit_once('/').map_or(once.as_str(), |(_, n)| n);
            prop_assert!(is_name_value(name), "bad name part: {:?}", name);
        }

        #[test]
        fn prop_label_value_idempotent_and_valid(s in any::<String>()) {
            let once = sanitize_label_value(&s);
            prop_assert_eq!(sanitize_label_value(&once), once.clone());
            prop_assert!(is_name_value(&once));
            prop_assert!(!once.chars().any(|c| c.is_ascii_uppercase()));
        }
    }
}
