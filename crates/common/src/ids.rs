//! Resource ID and namespaced-name helpers
//!
//! Terraform IDs are `namespace/name` for namespaced objects and a bare
//! `name` for cluster-scoped ones.

use crate::error::{Error, Result};
use crate::constants::DEFAULT_NAMESPACE;

/// Split a resource ID into `(namespace, name)`. Cluster-scoped IDs yield an
/// empty namespace.
pub fn id_parts(id: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(Error::InvalidId(id.to_string())),
    }
}

/// Split a three-part ID `namespace/owner/name`.
pub fn id_parts3(id: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [namespace, owner, name] if parts.iter().all(|p| !p.is_empty()) => {
            Ok((namespace.to_string(), owner.to_string(), name.to_string()))
        }
        _ => Err(Error::InvalidId(id.to_string())),
    }
}

/// Build a resource ID from its parts.
pub fn build_id(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Resolve a user-supplied reference that may or may not carry a namespace.
/// `"ubuntu"` resolves against `default_namespace`, falling back to `default`.
pub fn namespaced_name_parts(reference: &str, default_namespace: &str) -> Result<(String, String)> {
    let (namespace, name) = id_parts(reference)?;
    if !namespace.is_empty() {
        return Ok((namespace, name));
    }
    let namespace = if default_namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        default_namespace
    };
    Ok((namespace.to_string(), name))
}

/// Same as [`namespaced_name_parts`] but returns the joined `namespace/name`.
pub fn namespaced_name(reference: &str, default_namespace: &str) -> Result<String> {
    let (namespace, name) = namespaced_name_parts(reference, default_namespace)?;
    Ok(build_id(&namespace, &name))
}

/// Check a Kubernetes object name against RFC 1123 subdomain rules.
pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_parts() {
        assert_eq!(
            id_parts("default/foo").unwrap(),
            ("default".to_string(), "foo".to_string())
        );
        assert_eq!(id_parts("foo").unwrap(), (String::new(), "foo".to_string()));
        assert!(id_parts("a/b/c").is_err());
        assert!(id_parts("").is_err());
        assert!(id_parts("/foo").is_err());
    }

    #[test]
    fn test_id_parts3() {
        let (ns, vm, job) = id_parts3("default/vm1/daily").unwrap();
        assert_eq!((ns.as_str(), vm.as_str(), job.as_str()), ("default", "vm1", "daily"));
        assert!(id_parts3("default/vm1").is_err());
        assert!(id_parts3("default//daily").is_err());
    }

    #[test]
    fn test_build_id() {
        assert_eq!(build_id("default", "foo"), "default/foo");
        assert_eq!(build_id("", "mgmt"), "mgmt");
    }

    #[test]
    fn test_namespaced_name_defaults() {
        assert_eq!(namespaced_name("ubuntu", "images").unwrap(), "images/ubuntu");
        assert_eq!(namespaced_name("ubuntu", "").unwrap(), "default/ubuntu");
        assert_eq!(namespaced_name("other/ubuntu", "images").unwrap(), "other/ubuntu");
        assert!(namespaced_name("a/b/c", "default").is_err());
    }

    #[test]
    fn test_dns1123() {
        assert!(is_dns1123_subdomain("vm-1"));
        assert!(is_dns1123_subdomain("a.b-c"));
        assert!(!is_dns1123_subdomain("VM"));
        assert!(!is_dns1123_subdomain("-vm"));
        assert!(!is_dns1123_subdomain("vm_1"));
    }
}
