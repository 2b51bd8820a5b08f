//! Prefix based access rules.

use canopy_core::Path;

/// Read and write rules.
///
/// A location is unreadable when it lies at or beneath a denied read prefix.
/// A write is refused when it would touch a denied write prefix, which
/// includes writes to an ancestor of that prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rules {
    deny_read: Vec<Path>,
    deny_write: Vec<Path>,
}

impl Rules {
    /// Rules that allow everything.
    pub fn open() -> Self {
        Self::default()
    }

    /// Denies reads at and beneath `prefix`. Invalid prefixes are ignored.
    #[must_use]
    pub fn deny_read(mut self, prefix: &str) -> Self {
        if let Ok(path) = Path::parse(prefix) {
            self.deny_read.push(path);
        }
        self
    }

    /// Denies writes touching `prefix`. Invalid prefixes are ignored.
    #[must_use]
    pub fn deny_write(mut self, prefix: &str) -> Self {
        if let Ok(path) = Path::parse(prefix) {
            self.deny_write.push(path);
        }
        self
    }

    /// Whether `path` may be listened to.
    pub fn can_read(&self, path: &Path) -> bool {
        !self.deny_read.iter().any(|denied| denied.is_ancestor_of(path))
    }

    /// Whether a write at `path` is allowed.
    pub fn can_write(&self, path: &Path) -> bool {
        !self.deny_write.iter().any(|denied| denied.overlaps(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn open_rules_allow_all() {
        let rules = Rules::open();
        assert!(rules.can_read(&Path::root()));
        assert!(rules.can_write(&p("a/b")));
    }

    #[test]
    fn read_denial_covers_descendants_only() {
        let rules = Rules::open().deny_read("secret");
        assert!(!rules.can_read(&p("secret")));
        assert!(!rules.can_read(&p("secret/x")));
        assert!(rules.can_read(&p("public")));
        assert!(rules.can_read(&Path::root()));
    }

    #[test]
    fn write_denial_covers_ancestors() {
        let rules = Rules::open().deny_write("locked/item");
        assert!(!rules.can_write(&p("locked/item/x")));
        assert!(!rules.can_write(&p("locked")));
        assert!(!rules.can_write(&Path::root()));
        assert!(rules.can_write(&p("locked/other")));
    }

    proptest::proptest! {
        #[test]
        fn denied_writes_cover_the_whole_subtree(
            prefix in "[a-c]{1,2}(/[a-c]{1,2}){0,2}",
            below in "(/[a-c]{1,2}){0,3}",
        ) {
            let rules = Rules::open().deny_write(&prefix).deny_read(&prefix);
            let target = p(&format!("{prefix}{below}"));
            proptest::prop_assert!(!rules.can_write(&target));
            proptest::prop_assert!(!rules.can_read(&target));
            proptest::prop_assert!(!rules.can_write(&Path::root()));
        }
    }

    #[test]
    fn invalid_prefix_is_ignored() {
        let rules = Rules::open().deny_read("bad.key");
        assert_eq!(rules, Rules::open());
    }
}
