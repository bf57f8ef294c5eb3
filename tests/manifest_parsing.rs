use std::fs::write;

use stage_sync::error::ManifestError;
use stage_sync::manifest::{parse_manifest, read_manifest};
use tempfile::NamedTempFile;

struct TestCase {
    name: &'static str,
    manifest: &'static str,
    expected: Vec<&'static str>,
}

#[test]
fn returns_one_specifier_per_meaningful_line_in_file_order() {
    let test_cases = vec![
        TestCase {
            name: "pinned and ranged",
            manifest: "requests==2.31.0\nnumpy>=1.24\n",
            expected: vec!["requests==2.31.0", "numpy>=1.24"],
        },
        TestCase {
            name: "comments and blanks interleaved",
            manifest: "# runtime deps\n\nsnowflake-snowpark-python\n\n# data\npandas~=2.0\n   \n",
            expected: vec!["snowflake-snowpark-python", "pandas~=2.0"],
        },
        TestCase {
            name: "windows line endings and inline comments",
            manifest: "six==1.16.0\r\nattrs  # unpinned on purpose\r\n",
            expected: vec!["six==1.16.0", "attrs"],
        },
        TestCase {
            name: "extras and environment markers",
            manifest: "snowflake-connector-python[pandas]==3.6.0\ntomli>=2.0 ; python_version < \"3.11\"  # backport\n",
            expected: vec![
                "snowflake-connector-python[pandas]==3.6.0",
                "tomli>=2.0; python_version < \"3.11\"",
            ],
        },
        TestCase {
            name: "only comments",
            manifest: "# nothing yet\n",
            expected: vec![],
        },
    ];

    for case in test_cases {
        let specs = parse_manifest(case.manifest)
            .unwrap_or_else(|e| panic!("{}: unexpected error {e}", case.name));
        let rendered: Vec<String> = specs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, case.expected, "{}", case.name);
    }
}

#[test]
fn any_malformed_line_rejects_the_whole_manifest() {
    for manifest in [
        "requests==2.31.0\nnumpy >>= 1\n",
        "-r other.txt\nrequests\n",
        "requests\n==1.0\n",
        "requests==\n",
        "requests[socks>=2.31\n",
        "tomli>=2.0;\n",
        "git+https://github.com/psf/requests.git\n",
    ] {
        match parse_manifest(manifest) {
            Err(ManifestError::Parse { .. }) => {}
            other => panic!("{manifest:?} should fail to parse, got {other:?}"),
        }
    }
}

#[test]
fn read_manifest_reads_from_disk() {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), "requests==2.31.0\nnumpy>=1.24\n").unwrap();
    let specs = read_manifest(file.path()).expect("manifest should load");
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[1].name(), "numpy");
    assert_eq!(specs[1].version_constraint(), Some(">=1.24"));
}
