//! Drive the URL test-corpus runner over the bundled corpus files.

use std::path::{Path, PathBuf};

use monetdb_mapi::urltest;

fn corpus_files() -> Vec<PathBuf> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/urls");
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .expect("corpus directory")
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            (path.extension().and_then(|e| e.to_str()) == Some("md")).then_some(path)
        })
        .collect();
    files.sort();
    files
}

#[test]
fn bundled_corpus_passes() {
    let files = corpus_files();
    assert!(files.len() >= 3, "corpus files missing");
    for file in files {
        match urltest::run_file(&file, 0) {
            Ok(blocks) => assert!(blocks > 0, "{} has no test blocks", file.display()),
            Err(failure) => panic!("{failure}"),
        }
    }
}

#[test]
fn scoping_tags_are_honored() {
    let content = "\
```test
ONLY pymonetdb
REJECT monetdb://this-block-is-not-for-us
```
```test
ONLY libmapi
EXPECT valid=true
```
";
    assert_eq!(urltest::run_content("inline.md", content, 0).unwrap(), 2);
}
