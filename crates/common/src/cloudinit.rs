//! Cloud-init user data inspection

use std::collections::BTreeSet;

use serde_yaml::Value;

use crate::error::{Error, Result};

const SSH_AUTHORIZED_KEYS: &str = "ssh_authorized_keys";

/// A key pair referenced by a VM: its namespaced name and public key.
#[derive(Debug, Clone)]
pub struct KeyPairRef {
    pub namespaced_name: String,
    pub public_key: String,
}

/// Collect every `ssh_authorized_keys` entry at the document root and under
/// each `users` item.
pub fn authorized_keys(user_data: &str) -> Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    if user_data.trim().is_empty() {
        return Ok(keys);
    }
    let doc: Value = serde_yaml::from_str(user_data)?;
    collect_keys(&doc, &mut keys);
    if let Some(Value::Sequence(users)) = doc.get("users") {
        for user in users {
            collect_keys(user, &mut keys);
        }
    }
    Ok(keys)
}

fn collect_keys(node: &Value, keys: &mut BTreeSet<String>) {
    if let Some(Value::Sequence(entries)) = node.get(SSH_AUTHORIZED_KEYS) {
        for entry in entries {
            if let Value::String(key) = entry {
                keys.insert(normalize_key(key));
            }
        }
    }
}

/// Keys compare on `type material`; comments and surrounding whitespace are ignored.
fn normalize_key(key: &str) -> String {
    key.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

/// Fail unless every key pair's public key is listed in the user data.
pub fn check_keypairs_in_user_data(user_data: &str, keypairs: &[KeyPairRef]) -> Result<()> {
    if keypairs.is_empty() {
        return Ok(());
    }
    let present = authorized_keys(user_data)?;
    let missing: Vec<String> = keypairs
        .iter()
        .filter(|kp| !present.contains(&normalize_key(&kp.public_key)))
        .map(|kp| kp.namespaced_name.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::KeyPairsNotInUserData(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBs5 alice@laptop";

    fn keypair() -> Vec<KeyPairRef> {
        vec![KeyPairRef {
            namespaced_name: "default/alice".into(),
            public_key: KEY.into(),
        }]
    }

    #[test]
    fn test_key_at_root() {
        let user_data = format!("#cloud-config\nssh_authorized_keys:\n  - {}\n", KEY);
        assert!(check_keypairs_in_user_data(&user_data, &keypair()).is_ok());
    }

    #[test]
    fn test_key_under_users() {
        let user_data = format!(
            "#cloud-config\nusers:\n  - name: ubuntu\n    ssh_authorized_keys:\n      - {}\n",
            KEY
        );
        assert!(check_keypairs_in_user_data(&user_data, &keypair()).is_ok());
    }

    #[test]
    fn test_comment_is_ignored() {
        let user_data = "ssh_authorized_keys:\n  - ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBs5\n";
        assert!(check_keypairs_in_user_data(user_data, &keypair()).is_ok());
    }

    #[test]
    fn test_missing_key_at_root() {
        let user_data = "#cloud-config\npackages:\n  - qemu-guest-agent\n";
        let err = check_keypairs_in_user_data(user_data, &keypair()).unwrap_err();
        assert!(err.to_string().contains("default/alice"));
    }

    #[test]
    fn test_missing_key_in_users() {
        let user_data = "users:\n  - name: ubuntu\n    ssh_authorized_keys:\n      - ssh-rsa AAAAB3 other\n";
        assert!(check_keypairs_in_user_data(user_data, &keypair()).is_err());
    }

    #[test]
    fn test_empty_content_with_required_key() {
        assert!(check_keypairs_in_user_data("", &keypair()).is_err());
    }

    #[test]
    fn test_no_required_keys() {
        assert!(check_keypairs_in_user_data("", &[]).is_ok());
        assert!(check_keypairs_in_user_data("not: [valid", &[]).is_ok());
    }
}
