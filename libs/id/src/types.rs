//! Concrete ID types.

use crate::define_id;

define_id!(DeploymentId, "dep");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        let a = DeploymentId::new();
        let b = DeploymentId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn roundtrip_parse_format() {
        let id = DeploymentId::new();
        let s = id.to_string();
        assert!(s.starts_with("dep_"));
        let parsed = DeploymentId::parse(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(DeploymentId::parse(""), Err(crate::IdError::Empty));
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert_eq!(
            DeploymentId::parse("dep01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(crate::IdError::MissingSeparator)
        );
    }

    #[test]
    fn parse_rejects_wrong_prefix() {
        let err = DeploymentId::parse("node_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidPrefix { .. }));
    }

    #[test]
    fn parse_rejects_bad_ulid() {
        let err = DeploymentId::parse("dep_not-a-ulid").unwrap_err();
        assert!(matches!(err, crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn serde_roundtrip() {
        let id = DeploymentId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: DeploymentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let a = DeploymentId::from_ulid(ulid::Ulid::from_parts(1, 0));
        let b = DeploymentId::from_ulid(ulid::Ulid::from_parts(2, 0));
        assert!(a < b);
    }
}
