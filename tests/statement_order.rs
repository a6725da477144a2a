mod util;

use pkgstore::prelude::*;
use pkgstore::repo::filerepo::FileRepo;
use pkgstore::repo::memoryrepo::MemoryRepo;
use proptest::prelude::*;
use util::*;

fn statement() -> impl Strategy<Value = PackageStatement> {
    (
        "[a-z]{1,8}",
        prop::collection::vec("[ -~]{0,16}", 0..4),
    )
        .prop_map(|(keyword, arguments)| PackageStatement::new(keyword, arguments))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn memory_preserves_order(statements in prop::collection::vec(statement(), 0..64)) {
        let repo = MemoryRepo::new();
        commit(&repo, "alpha", "1.0", statements.clone());
        prop_assert_eq!(read(&repo, "alpha", "1.0"), statements);
    }

    #[test]
    fn file_preserves_order(statements in prop::collection::vec(statement(), 0..64)) {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepo::open(dir.path()).unwrap();
        commit(&repo, "alpha", "1.0", statements.clone());
        prop_assert_eq!(read(&repo, "alpha", "1.0"), statements);
    }
}
