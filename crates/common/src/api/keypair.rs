//! KeyPair (harvesterhci.io/v1beta1)

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::Condition;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "KeyPair",
    plural = "keypairs",
    namespaced,
    status = "KeyPairStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairSpec {
    pub public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairStatus {
    #[serde(default, rename = "fingerPrint")]
    pub finger_print: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
