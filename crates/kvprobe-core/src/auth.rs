//! Identities, roles and key-range permissions
//!
//! Key ranges follow the store's half-open `[start, end)` convention:
//! no end means a single key, an end of `"\0"` means "every key >= start".

use std::fmt;

use serde::Serialize;

/// Range end that selects every key at or after the range start.
pub const OPEN_RANGE_END: &[u8] = b"\0";

/// Kind of access a permission grants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PermissionKind {
    Read,
    Write,
    ReadWrite,
}

impl PermissionKind {
    #[inline]
    pub fn allows_read(self) -> bool {
        matches!(self, PermissionKind::Read | PermissionKind::ReadWrite)
    }

    #[inline]
    pub fn allows_write(self) -> bool {
        matches!(self, PermissionKind::Write | PermissionKind::ReadWrite)
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionKind::Read => "read",
            PermissionKind::Write => "write",
            PermissionKind::ReadWrite => "readwrite",
        };
        f.write_str(name)
    }
}

/// A key or a half-open key range
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Option<Vec<u8>>,
}

impl KeyRange {
    /// Exactly one key
    pub fn single(key: impl Into<Vec<u8>>) -> Self {
        KeyRange {
            start: key.into(),
            end: None,
        }
    }

    /// Every key starting with `prefix`
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let start = prefix.into();
        let end = prefix_range_end(&start);
        KeyRange {
            start,
            end: Some(end),
        }
    }

    /// Explicit `[start, end)` range
    pub fn range(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        KeyRange {
            start: start.into(),
            end: Some(end.into()),
        }
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    /// Exclusive range end, `None` for a single key
    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    pub fn is_single(&self) -> bool {
        self.end.is_none()
    }

    /// Check whether `key` falls inside this range
    pub fn contains(&self, key: &[u8]) -> bool {
        match &self.end {
            None => key == self.start.as_slice(),
            Some(end) if end.as_slice() == OPEN_RANGE_END => key >= self.start.as_slice(),
            Some(end) => key >= self.start.as_slice() && key < end.as_slice(),
        }
    }

    /// Check whether two ranges share no key
    pub fn is_disjoint(&self, other: &KeyRange) -> bool {
        let (a_lo, a_hi) = self.bounds();
        let (b_lo, b_hi) = other.bounds();
        let a_before_b = match &a_hi {
            Bound::Inclusive(hi) => hi.as_slice() < b_lo,
            Bound::Exclusive(hi) => hi.as_slice() <= b_lo,
            Bound::Unbounded => false,
        };
        let b_before_a = match &b_hi {
            Bound::Inclusive(hi) => hi.as_slice() < a_lo,
            Bound::Exclusive(hi) => hi.as_slice() <= a_lo,
            Bound::Unbounded => false,
        };
        a_before_b || b_before_a
    }

    fn bounds(&self) -> (&[u8], Bound) {
        let hi = match &self.end {
            None => Bound::Inclusive(self.start.clone()),
            Some(end) if end.as_slice() == OPEN_RANGE_END => Bound::Unbounded,
            Some(end) => Bound::Exclusive(end.clone()),
        };
        (self.start.as_slice(), hi)
    }
}

enum Bound {
    Inclusive(Vec<u8>),
    Exclusive(Vec<u8>),
    Unbounded,
}

/// Smallest key greater than every key carrying `prefix`.
///
/// Increments the last byte below 0xff and drops everything after it;
/// an all-0xff (or empty) prefix has no upper bound.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    OPEN_RANGE_END.to_vec()
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRange({})", self)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = String::from_utf8_lossy(&self.start);
        match &self.end {
            None => write!(f, "{}", start),
            Some(end) if end.as_slice() == OPEN_RANGE_END => write!(f, "[{}, <end>)", start),
            Some(end) => write!(f, "[{}, {})", start, String::from_utf8_lossy(end)),
        }
    }
}

/// A permission grant owned by a role
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub range: KeyRange,
    pub kind: PermissionKind,
}

impl Grant {
    pub fn new(range: KeyRange, kind: PermissionKind) -> Self {
        Grant { range, kind }
    }

    pub fn read_write(range: KeyRange) -> Self {
        Self::new(range, PermissionKind::ReadWrite)
    }
}

/// A named role and its grants
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Role {
    pub name: String,
    pub grants: Vec<Grant>,
}

impl Role {
    pub fn new(name: &str) -> Self {
        Role {
            name: name.to_string(),
            grants: Vec::new(),
        }
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    /// Check whether any grant allows writing `key`
    pub fn can_write(&self, key: &[u8]) -> bool {
        self.grants
            .iter()
            .any(|g| g.kind.allows_write() && g.range.contains(key))
    }

    /// Check whether any grant allows reading `key`
    pub fn can_read(&self, key: &[u8]) -> bool {
        self.grants
            .iter()
            .any(|g| g.kind.allows_read() && g.range.contains(key))
    }
}

/// A user account: credentials plus granted role names
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(username: &str, password: &str) -> Self {
        Identity {
            username: username.to_string(),
            password: password.to_string(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }
}

// Passwords stay out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end(b"/test/"), b"/test0".to_vec());
        assert_eq!(prefix_range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_range_end(b"\xff\xff"), OPEN_RANGE_END.to_vec());
        assert_eq!(prefix_range_end(b""), OPEN_RANGE_END.to_vec());
    }

    #[test]
    fn test_prefix_contains() {
        let range = KeyRange::prefix("/test/");
        assert!(range.contains(b"/test/0"));
        assert!(range.contains(b"/test/key"));
        assert!(!range.contains(b"/test0"));
        assert!(!range.contains(b"/other"));
    }

    #[test]
    fn test_single_key_disjoint_from_prefix() {
        let prefix = KeyRange::prefix("/test/");
        let single = KeyRange::single("/test0");
        assert!(prefix.is_disjoint(&single));
        assert!(single.is_disjoint(&prefix));
        assert!(!prefix.is_disjoint(&KeyRange::single("/test/x")));
    }

    #[test]
    fn test_open_range() {
        let range = KeyRange::range("m", OPEN_RANGE_END.to_vec());
        assert!(range.contains(b"m"));
        assert!(range.contains(b"zzz"));
        assert!(!range.contains(b"a"));
    }

    #[test]
    fn test_role_permissions() {
        let role = Role::new("test")
            .with_grant(Grant::read_write(KeyRange::prefix("/test/")))
            .with_grant(Grant::new(KeyRange::single("/ro"), PermissionKind::Read));

        assert!(role.can_write(b"/test/1"));
        assert!(role.can_read(b"/ro"));
        assert!(!role.can_write(b"/ro"));
        assert!(!role.can_write(b"/elsewhere"));
    }

    #[test]
    fn test_identity_debug_hides_password() {
        let identity = Identity::new("root", "rootPassword").with_role("root");
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("root"));
        assert!(!rendered.contains("rootPassword"));
    }

    proptest! {
        #[test]
        fn prefix_range_contains_every_extension(
            prefix in proptest::collection::vec(any::<u8>(), 1..8),
            suffix in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let range = KeyRange::prefix(prefix.clone());
            let mut key = prefix.clone();
            key.extend_from_slice(&suffix);
            prop_assert!(range.contains(&key));
        }

        #[test]
        fn prefix_range_excludes_keys_without_prefix(
            prefix in proptest::collection::vec(1u8..0xff, 1..6),
            key in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let range = KeyRange::prefix(prefix.clone());
            prop_assert_eq!(range.contains(&key), key.starts_with(&prefix));
        }
    }
}
