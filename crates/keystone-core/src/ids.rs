use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ProjectId, "proj");
branded_id!(BrainstormId, "bs");
branded_id!(SnapshotId, "snap");
branded_id!(OutputId, "syn");
branded_id!(SystemId, "sys");
branded_id!(DetailId, "det");
branded_id!(DependencyId, "dep");
branded_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(ProjectId::new().as_str().starts_with("proj_"));
        assert!(BrainstormId::new().as_str().starts_with("bs_"));
        assert!(SnapshotId::new().as_str().starts_with("snap_"));
        assert!(OutputId::new().as_str().starts_with("syn_"));
        assert!(SystemId::new().as_str().starts_with("sys_"));
        assert!(DetailId::new().as_str().starts_with("det_"));
        assert!(DependencyId::new().as_str().starts_with("dep_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = SystemId::new();
        let b = SystemId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = ProjectId::new();
        let parsed: ProjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SystemId::from_raw("sys_custom");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""sys_custom""#);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<SnapshotId> = (0..100).map(|_| SnapshotId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
