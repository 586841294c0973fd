//! Acceptance scenarios against a live Harvester cluster.
//!
//! Marked ignored: they need `terraform`, `kubectl`, a built provider and a
//! cluster reachable through `KUBECONFIG`. Run with
//! `cargo test -p harvester-e2e -- --ignored`.

use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use harvester_common::constants::DEFAULT_NAMESPACE;
use harvester_e2e::kubectl::field;
use harvester_e2e::{init_logging, preflight, unique_name, Kubectl, Workspace};

/// Provider directory, or `None` (after saying why) when the scenario
/// cannot run here.
fn ready() -> Option<PathBuf> {
    init_logging();
    match preflight() {
        Ok(dir) => Some(dir),
        Err(e) => {
            eprintln!("Skipping: {e}");
            None
        }
    }
}

/// Poll until `check` holds; deletes finish asynchronously behind finalizers.
fn eventually(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return;
        }
        sleep(Duration::from_secs(2));
    }
    panic!("timed out waiting for {what}");
}

#[test]
#[ignore]
fn image_rejects_empty_display_name() {
    let Some(dir) = ready() else { return };
    let ws = Workspace::new(&dir).unwrap();
    ws.write_config(&format!(
        r#"
resource "harvester_image" "test" {{
  name         = "{}"
  display_name = ""
  source_type  = "download"
  url          = "https://cloud-images.ubuntu.com/minimal/releases/jammy/release/ubuntu-22.04-minimal-cloudimg-amd64.img"
}}
"#,
        unique_name("tf-acc-image")
    ))
    .unwrap();

    let run = ws.apply_expect_error().unwrap();
    assert!(run.error_contains("must not be empty"), "{}", run.stderr);
}

#[test]
#[ignore]
fn image_download_requires_url() {
    let Some(dir) = ready() else { return };
    let ws = Workspace::new(&dir).unwrap();
    ws.write_config(&format!(
        r#"
resource "harvester_image" "test" {{
  name         = "{}"
  display_name = "acceptance"
  source_type  = "download"
  url          = ""
}}
"#,
        unique_name("tf-acc-image")
    ))
    .unwrap();

    let run = ws.apply_expect_error().unwrap();
    assert!(run.error_contains("url to not be empty"), "{}", run.stderr);
}

#[test]
#[ignore]
fn network_rejects_out_of_range_vlan() {
    let Some(dir) = ready() else { return };
    let ws = Workspace::new(&dir).unwrap();
    ws.write_config(&format!(
        r#"
resource "harvester_network" "test" {{
  name                 = "{}"
  cluster_network_name = "mgmt"
  vlan_id              = 4095
}}
"#,
        unique_name("tf-acc-net")
    ))
    .unwrap();

    let run = ws.apply_expect_error().unwrap();
    assert!(run.error_contains("range (0 - 4094)"), "{}", run.stderr);
}

#[test]
#[ignore]
fn volume_create_and_destroy() {
    let Some(dir) = ready() else { return };
    let name = unique_name("tf-acc-vol");
    let kubectl = Kubectl::new();
    let ws = Workspace::new(&dir).unwrap();
    ws.write_config(&format!(
        r#"
resource "harvester_volume" "test" {{
  name = "{name}"
  size = "1Gi"
}}
"#
    ))
    .unwrap();

    ws.apply().unwrap();
    let pvc = kubectl
        .get("persistentvolumeclaims", DEFAULT_NAMESPACE, &name)
        .unwrap()
        .expect("volume exists after apply");
    assert_eq!(
        field(&pvc, "spec.resources.requests.storage").and_then(|v| v.as_str()),
        Some("1Gi")
    );
    assert!(ws.plan_is_empty().unwrap(), "plan after apply is not empty");

    ws.destroy().unwrap();
    eventually("volume deletion", Duration::from_secs(120), || {
        matches!(
            kubectl.get("persistentvolumeclaims", DEFAULT_NAMESPACE, &name),
            Ok(None)
        )
    });
}

#[test]
#[ignore]
fn virtual_machine_memory_update() {
    let Some(dir) = ready() else { return };
    let name = unique_name("tf-acc-vm");
    let kubectl = Kubectl::new();
    let ws = Workspace::new(&dir).unwrap();
    let config = |memory: &str| {
        format!(
            r#"
resource "harvester_virtualmachine" "test" {{
  name   = "{name}"
  cpu    = 1
  memory = "{memory}"

  run_strategy = "Halted"

  network_interface {{
    name = "default"
  }}

  disk {{
    name                 = "rootdisk"
    type                 = "disk"
    bus                  = "virtio"
    boot_order           = 1
    container_image_name = "kubevirt/fedora-cloud-container-disk-demo:v0.35.0"
  }}
}}
"#
        )
    };

    ws.write_config(&config("1Gi")).unwrap();
    ws.apply().unwrap();
    assert_eq!(
        ws.state_attribute("harvester_virtualmachine.test", "memory")
            .unwrap()
            .and_then(|v| v.as_str().map(String::from))
            .as_deref(),
        Some("1Gi")
    );

    ws.write_config(&config("2Gi")).unwrap();
    ws.apply().unwrap();
    assert_eq!(
        ws.state_attribute("harvester_virtualmachine.test", "memory")
            .unwrap()
            .and_then(|v| v.as_str().map(String::from))
            .as_deref(),
        Some("2Gi")
    );
    let vm = kubectl
        .get("virtualmachines.kubevirt.io", DEFAULT_NAMESPACE, &name)
        .unwrap()
        .expect("virtual machine exists");
    assert_eq!(
        field(&vm, "spec.template.spec.domain.resources.limits.memory").and_then(|v| v.as_str()),
        Some("2Gi")
    );

    ws.destroy().unwrap();
}

#[test]
#[ignore]
fn setting_destroy_resets_value() {
    let Some(dir) = ready() else { return };
    let kubectl = Kubectl::new();
    let ws = Workspace::new(&dir).unwrap();
    ws.write_config(
        r#"
resource "harvester_setting" "log_level" {
  name  = "log-level"
  value = "Debug"
}
"#,
    )
    .unwrap();

    ws.apply().unwrap();
    let setting = kubectl
        .get("settings.harvesterhci.io", "", "log-level")
        .unwrap()
        .expect("setting exists");
    assert_eq!(field(&setting, "value").and_then(|v| v.as_str()), Some("Debug"));

    ws.destroy().unwrap();
    let setting = kubectl
        .get("settings.harvesterhci.io", "", "log-level")
        .unwrap()
        .expect("settings are never deleted");
    assert_eq!(
        field(&setting, "value").and_then(|v| v.as_str()).unwrap_or_default(),
        ""
    );
}
