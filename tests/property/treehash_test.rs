// tests/property/treehash_test.rs

//! Property tests for the dual tree-hash convention: hashing must be
//! deterministic, and the skip-empty hash must never depend on whether an
//! otherwise-identical archive also carries an empty directory entry.

use pkgvault::core::fetch::treehash::{self, Materialized};
use proptest::prelude::*;
use tar::{Builder, EntryType, Header};

fn build_tar(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, content.as_slice()).unwrap();
    }
    let mut out = builder.into_inner().unwrap();
    out
}

fn arb_filename() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn arb_files() -> impl Strategy<Value = Vec<(String, Vec<u8>)>> {
    prop::collection::vec((arb_filename(), prop::collection::vec(any::<u8>(), 0..64)), 0..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn hashing_is_deterministic(files in arb_files()) {
        let tar_bytes = build_tar(&files);
        let a = treehash::compute_tree_hashes(&Materialized::InMemory(tar_bytes.clone())).unwrap();
        let b = treehash::compute_tree_hashes(&Materialized::InMemory(tar_bytes)).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn no_skip_hash_always_valid_hex_sha1(files in arb_files()) {
        let tar_bytes = build_tar(&files);
        let hashes = treehash::compute_tree_hashes(&Materialized::InMemory(tar_bytes)).unwrap();
        prop_assert_eq!(hashes.no_skip.len(), 40);
        prop_assert!(hashes.no_skip.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(hashes.skip_empty.len(), 40);
        prop_assert!(hashes.skip_empty.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn appending_a_trailing_empty_directory_changes_only_the_no_skip_hash(
        files in arb_files(), dirname in arb_filename()
    ) {
        let base_tar = build_tar(&files);
        let base = treehash::compute_tree_hashes(&Materialized::InMemory(base_tar)).unwrap();

        // Append an empty directory entry that is not a parent of any file.
        let mut builder = Builder::new(Vec::new());
        for (path, content) in &files {
            let mut header = Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_entry_type(EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, content.as_slice()).unwrap();
        }
        let dir_path = format!("{dirname}-standalone-dir/");
        let mut dir_header = Header::new_gnu();
        dir_header.set_path(&dir_path).unwrap();
        dir_header.set_entry_type(EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_cksum();
        builder.append(&dir_header, &b""[..]).unwrap();
        let with_dir_tar = builder.into_inner().unwrap();

        let with_dir = treehash::compute_tree_hashes(&Materialized::InMemory(with_dir_tar)).unwrap();

        prop_assert_eq!(with_dir.skip_empty, base.skip_empty);
        prop_assert_ne!(with_dir.no_skip, base.no_skip);
    }
}
