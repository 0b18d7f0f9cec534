//! Default/instance configuration merge
//!
//! Presence wins: a field set on the instance replaces the default, an unset
//! field falls through. Lists and maps are replaced wholesale, except id-keyed
//! lists merged with [`merge_by_id`].

use crate::config::BaseInstanceConfig;

/// Field-by-field "presence wins" merge
pub trait Merge {
    /// Merge `other` into `self`; fields set on `other` take precedence.
    fn merge(&mut self, other: Self);
}

/// Entries of a list that is unioned by id rather than replaced
pub trait Identified {
    fn identity(&self) -> Option<&str>;
}

/// Merge one defaults/instance pair into the effective configuration.
///
/// Pure and free of I/O; `merge(&merge(d, i), i) == merge(d, i)`.
pub fn merge<T: Merge + Clone>(defaults: &T, instance: &T) -> T {
    let mut effective = defaults.clone();
    effective.merge(instance.clone());
    effective
}

/// Replace `slot` only when `value` is present
pub fn set_if_present<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Replace `slot` only when `value` is non-empty
pub fn replace_if_non_empty<T>(slot: &mut Vec<T>, value: Vec<T>) {
    if !value.is_empty() {
        *slot = value;
    }
}

/// Union two id-keyed lists: matching ids merge recursively, new ids append.
pub fn merge_by_id<T: Merge + Identified>(base: &mut Vec<T>, other: Vec<T>) {
    for entry in other {
        let existing = entry.identity().and_then(|id| {
            base.iter()
                .position(|candidate| candidate.identity() == Some(id))
        });
        match existing {
            Some(index) => base[index].merge(entry),
            None => base.push(entry),
        }
    }
}

impl Merge for BaseInstanceConfig {
    fn merge(&mut self, other: Self) {
        set_if_present(&mut self.id, other.id);
        set_if_present(&mut self.kind, other.kind);
        set_if_present(&mut self.subnet, other.subnet);
        set_if_present(&mut self.security_group, other.security_group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Sized {
        base: BaseInstanceConfig,
        size: Option<u32>,
        enabled: Option<bool>,
        tags: Vec<String>,
        members: Vec<Member>,
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Member {
        id: Option<String>,
        weight: Option<u32>,
    }

    impl Identified for Member {
        fn identity(&self) -> Option<&str> {
            self.id.as_deref()
        }
    }

    impl Merge for Member {
        fn merge(&mut self, other: Self) {
            set_if_present(&mut self.id, other.id);
            set_if_present(&mut self.weight, other.weight);
        }
    }

    impl Merge for Sized {
        fn merge(&mut self, other: Self) {
            self.base.merge(other.base);
            set_if_present(&mut self.size, other.size);
            set_if_present(&mut self.enabled, other.enabled);
            replace_if_non_empty(&mut self.tags, other.tags);
            merge_by_id(&mut self.members, other.members);
        }
    }

    fn member(id: &str, weight: Option<u32>) -> Member {
        Member {
            id: Some(id.to_string()),
            weight,
        }
    }

    #[test]
    fn test_absent_field_falls_through() {
        let defaults = Sized {
            size: Some(10),
            ..Default::default()
        };
        let effective = merge(&defaults, &Sized::default());
        assert_eq!(effective.size, Some(10));
    }

    #[test]
    fn test_present_field_wins() {
        let defaults = Sized {
            size: Some(10),
            ..Default::default()
        };
        let instance = Sized {
            size: Some(20),
            ..Default::default()
        };
        assert_eq!(merge(&defaults, &instance).size, Some(20));
    }

    #[test]
    fn test_explicit_false_and_zero_override() {
        let defaults = Sized {
            size: Some(10),
            enabled: Some(true),
            ..Default::default()
        };
        let instance = Sized {
            size: Some(0),
            enabled: Some(false),
            ..Default::default()
        };
        let effective = merge(&defaults, &instance);
        assert_eq!(effective.size, Some(0));
        assert_eq!(effective.enabled, Some(false));
    }

    #[test]
    fn test_base_fields_merge() {
        let defaults = Sized {
            base: BaseInstanceConfig {
                subnet: Some("private".into()),
                security_group: Some("private".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let instance = Sized {
            base: BaseInstanceConfig {
                id: Some("web".into()),
                subnet: Some("public".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let effective = merge(&defaults, &instance);
        assert_eq!(effective.base.id(), "web");
        assert_eq!(effective.base.subnet.as_deref(), Some("public"));
        assert_eq!(effective.base.security_group.as_deref(), Some("private"));
    }

    #[test]
    fn test_lists_replace() {
        let defaults = Sized {
            tags: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let instance = Sized {
            tags: vec!["c".into()],
            ..Default::default()
        };
        assert_eq!(merge(&defaults, &instance).tags, vec!["c".to_string()]);
        assert_eq!(merge(&defaults, &Sized::default()).tags.len(), 2);
    }

    #[test]
    fn test_merge_by_id_unions() {
        let defaults = Sized {
            members: vec![member("a", Some(1)), member("b", Some(2))],
            ..Default::default()
        };
        let instance = Sized {
            members: vec![member("b", Some(5)), member("c", None)],
            ..Default::default()
        };
        let effective = merge(&defaults, &instance);
        assert_eq!(
            effective.members,
            vec![
                member("a", Some(1)),
                member("b", Some(5)),
                member("c", None)
            ]
        );
    }

    #[test]
    fn test_merge_by_id_keeps_existing_fields() {
        let mut base = vec![member("a", Some(3))];
        merge_by_id(&mut base, vec![member("a", None)]);
        assert_eq!(base, vec![member("a", Some(3))]);
    }

    fn arb_members() -> impl Strategy<Value = Vec<Member>> {
        prop::collection::vec(
            (prop::sample::select(vec!["a", "b", "c"]), prop::option::of(0u32..5))
                .prop_map(|(id, weight)| member(id, weight)),
            0..4,
        )
        .prop_map(|members| {
            // id-keyed lists carry unique ids within one document
            let mut unique: Vec<Member> = Vec::new();
            for m in members {
                if !unique.iter().any(|u| u.id == m.id) {
                    unique.push(m);
                }
            }
            unique
        })
    }

    fn arb_sized() -> impl Strategy<Value = Sized> {
        (
            prop::option::of("[a-z]{1,6}"),
            prop::option::of(prop::sample::select(vec!["public", "private", "isolated"])),
            prop::option::of(0u32..100),
            prop::option::of(any::<bool>()),
            prop::collection::vec("[a-z]{1,3}", 0..3),
            arb_members(),
        )
            .prop_map(|(id, subnet, size, enabled, tags, members)| Sized {
                base: BaseInstanceConfig {
                    id,
                    subnet: subnet.map(str::to_string),
                    ..Default::default()
                },
                size,
                enabled,
                tags,
                members,
            })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(defaults in arb_sized(), instance in arb_sized()) {
            let once = merge(&defaults, &instance);
            let twice = merge(&once, &instance);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_with_empty_instance_is_identity(defaults in arb_sized()) {
            prop_assert_eq!(merge(&defaults, &Sized::default()), defaults);
        }
    }
}
