//! Cache key grammar.
//!
//! Four key shapes share the cache store:
//!
//! | Shape | Grammar | Example |
//! |-------|---------|---------|
//! | family version counter | `<family>:version` | `content-list:version` |
//! | versioned family entry | `<family>:v<version>:<discriminator>` | `content-list:v4:1:10` |
//! | direct single item | `<resource>:<id>` | `content:p1` |
//! | rate bucket | `rl:<scope>:<actor>` | `rl:content-create:u1` |
//!
//! Names (family, resource, scope) are single words: non-empty and free of
//! `:`. The free-form tail (discriminator, id, actor) always comes last, so
//! the prefix before it is unambiguous. `rl` is reserved for rate buckets.
//! Families and resources must not share a name; the services use
//! `content-list`/`search` for families and `content` for items.

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Prefix reserved for rate-limit buckets.
pub const RATE_PREFIX: &str = "rl";

/// Suffix of a family's version counter key.
const VERSION_SUFFIX: &str = "version";

/// Error for an invalid key name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Empty name.
    #[error("Cache key name must not be empty")]
    Empty,

    /// Name contains the separator.
    #[error("Cache key name '{0}' must not contain ':'")]
    Separator(String),

    /// Name is reserved.
    #[error("Cache key name '{0}' is reserved")]
    Reserved(String),
}

fn check_name(name: &str) -> Result<(), KeyError> {
    if name.is_empty() {
        return Err(KeyError::Empty);
    }
    if name.contains(':') {
        return Err(KeyError::Separator(name.to_string()));
    }
    if name == RATE_PREFIX {
        return Err(KeyError::Reserved(name.to_string()));
    }
    Ok(())
}

macro_rules! key_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Cow<'static, str>);

        impl $name {
            /// Name known at compile time. Must be a valid name; see the module docs.
            #[must_use]
            pub const fn from_static(name: &'static str) -> Self {
                Self(Cow::Borrowed(name))
            }

            /// Validate a runtime name.
            ///
            /// # Errors
            ///
            /// Returns [`KeyError`] if the name is empty, contains `:` or is reserved.
            pub fn parse(name: impl Into<String>) -> Result<Self, KeyError> {
                let name = name.into();
                check_name(&name)?;
                Ok(Self(Cow::Owned(name)))
            }

            /// The name.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

key_name!(
    /// A group of derived entries invalidated together by bumping its version.
    CacheFamily
);

key_name!(
    /// A resource cached per item and invalidated by deleting its key.
    ItemResource
);

key_name!(
    /// Rate-limit policy scope.
    RateScope
);

/// `<family>:version`
#[must_use]
pub fn version_key(family: &CacheFamily) -> String {
    format!("{family}:{VERSION_SUFFIX}")
}

/// `<family>:v<version>:<discriminator>`
#[must_use]
pub fn entry_key(family: &CacheFamily, version: u64, discriminator: &str) -> String {
    format!("{family}:v{version}:{discriminator}")
}

/// `<resource>:<id>`
#[must_use]
pub fn item_key(resource: &ItemResource, id: &str) -> String {
    format!("{resource}:{id}")
}

/// `rl:<scope>:<actor>`
#[must_use]
pub fn rate_key(scope: &RateScope, actor: &str) -> String {
    format!("{RATE_PREFIX}:{scope}:{actor}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIST: CacheFamily = CacheFamily::from_static("content-list");

    #[test]
    fn keys_follow_documented_shapes() {
        assert_eq!(version_key(&LIST), "content-list:version");
        assert_eq!(entry_key(&LIST, 4, "1:10"), "content-list:v4:1:10");
        assert_eq!(
            item_key(&ItemResource::from_static("content"), "p1"),
            "content:p1"
        );
        assert_eq!(
            rate_key(&RateScope::from_static("global"), "::1"),
            "rl:global:::1"
        );
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(CacheFamily::parse(""), Err(KeyError::Empty));
        assert!(matches!(CacheFamily::parse("a:b"), Err(KeyError::Separator(_))));
        assert!(matches!(ItemResource::parse("rl"), Err(KeyError::Reserved(_))));
        assert_eq!(RateScope::parse("register").unwrap().as_str(), "register");
    }

    #[test]
    fn version_counter_never_collides_with_entries() {
        // Entries always carry a `v<digits>` segment; the counter carries `version`.
        let counter = version_key(&LIST);
        for version in [0, 1, 42, u64::MAX] {
            assert!(!entry_key(&LIST, version, "").starts_with(&counter));
            assert_ne!(entry_key(&LIST, version, "ersion"), counter);
        }
    }

    proptest! {
        #[test]
        fn distinct_inputs_give_distinct_entry_keys(
            family_a in "[a-z-]{1,10}",
            family_b in "[a-z-]{1,10}",
            version_a in 1u64..1000,
            version_b in 1u64..1000,
            disc_a in ".{0,12}",
            disc_b in ".{0,12}",
        ) {
            prop_assume!(family_a != RATE_PREFIX && family_b != RATE_PREFIX);
            let fa = CacheFamily::parse(family_a.clone()).unwrap();
            let fb = CacheFamily::parse(family_b.clone()).unwrap();
            let same = family_a == family_b && version_a == version_b && disc_a == disc_b;
            prop_assert_eq!(
                entry_key(&fa, version_a, &disc_a) == entry_key(&fb, version_b, &disc_b),
                same
            );
        }

        #[test]
        fn rate_keys_never_collide_with_family_keys(
            family in "[a-z-]{1,10}",
            scope in "[a-z-]{1,10}",
            version in 1u64..1000,
            tail in ".{0,12}",
        ) {
            prop_assume!(family != RATE_PREFIX && scope != RATE_PREFIX);
            let family = CacheFamily::parse(family).unwrap();
            let scope = RateScope::parse(scope).unwrap();
            prop_assert_ne!(rate_key(&scope, &tail), entry_key(&family, version, &tail));
            prop_assert_ne!(rate_key(&scope, &tail), version_key(&family));
        }
    }
}
