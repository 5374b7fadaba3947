//! Load profile file handling: parsing, overrides, and validation flow.

use std::io::Write;

use tempfile::NamedTempFile;

use kubeload::config::{ContentType, LoadProfile, RequestKind};

const PROFILE: &str = r#"
version: 1
description: "mixed read benchmark"
spec:
  conns: 4
  client: 8
  contentType: json
  rate: 200
  total: 10000
  maxRetries: 2
  requests:
    - shares: 600
      staleList:
        version: v1
        resource: pods
        namespace: kperf
        selector: app=kperf
        limit: 1000
    - shares: 300
      watchList:
        version: v1
        resource: configmaps
        namespace: kperf
    - shares: 100
      getPodLog:
        namespace: kperf
        name: runner-0
        container: runner
        tailLines: 100
"#;

#[test]
fn test_load_profile_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(PROFILE.as_bytes()).unwrap();

    let profile = LoadProfile::from_file(file.path()).unwrap();
    profile.validate().unwrap();

    assert_eq!(profile.description, "mixed read benchmark");
    assert_eq!(profile.spec.conns, 4);
    assert_eq!(profile.spec.client, 8);
    assert_eq!(profile.spec.rate, 200.0);
    assert_eq!(profile.spec.total, 10_000);
    assert_eq!(profile.spec.max_retries, 2);
    assert_eq!(profile.spec.content_type, ContentType::Json);

    let shares: Vec<u32> = profile.spec.requests.iter().map(|r| r.shares).collect();
    assert_eq!(shares, vec![600, 300, 100]);

    match profile.spec.requests[2].kind().unwrap() {
        RequestKind::GetPodLog(log) => {
            assert_eq!(log.name, "runner-0");
            assert_eq!(log.tail_lines, Some(100));
            assert_eq!(log.limit_bytes, None);
        }
        other => panic!("expected pod log entry, got {:?}", other),
    }
}

#[test]
fn test_missing_file_is_a_read_error() {
    let err = LoadProfile::from_file("/definitely/not/here.yaml").unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn test_override_then_validate_flow() {
    // Mirrors the CLI: parse first, then override, then validate.
    let mut profile = LoadProfile::from_yaml(PROFILE).unwrap();
    profile.spec.rate = 0.0;
    profile.spec.total = 500;
    profile.spec.conns = 1;
    profile.validate().unwrap();

    // An override can also make the profile invalid.
    profile.spec.conns = 0;
    assert!(profile.validate().is_err());
}

#[test]
fn test_malformed_yaml_is_a_parse_error() {
    let err = LoadProfile::from_yaml("version: [nope").unwrap_err();
    assert!(err.to_string().contains("failed to parse YAML"));
}
